pub mod table;

pub use table::{HeapError, TableHeap};
