//! Parser for tickos task bodies
//!
//! Task bodies are written in a pared-down JavaScript-family language. This
//! crate provides:
//! - **Lexer**: logos-based tokenizer with source spans (`lexer` module)
//! - **AST**: statement and expression node types (`ast` module)
//! - **Parser**: recursive descent parser producing a [`TaskBody`]
//!   (`parser` module)
//!
//! # Example
//!
//! ```
//! use tickos_parser::parse_task_body;
//!
//! let body = parse_task_body(
//!     r#"
//!     (rtos) => {
//!         let i = 0;
//!         while (i < 10) {
//!             print(i);
//!             rtos.delay(1);
//!             i = i + 1;
//!         }
//!     }
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(body.params[0].name, "rtos");
//! ```

#![warn(rust_2018_idioms)]

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::TaskBody;
pub use lexer::{LexError, Lexer};
pub use parser::{parse_task_body, ParseError, ParseErrorKind, Parser};
pub use token::{Span, Token};
