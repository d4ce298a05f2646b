mod core;
mod hashmap;

pub use core::{Group, Persist, Value};
pub use hashmap::HashMapGroup;
