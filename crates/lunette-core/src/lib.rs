//! Lunette core types: values, object headers, the heap arena, strings and tables.

pub mod gc;
pub mod object;
pub mod string;
pub mod table;
pub mod value;
