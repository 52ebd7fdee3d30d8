pub mod bits;
pub mod error;
pub mod flow;
pub mod mem;

// Re-export commonly used types
pub use bits::{AliasTable, Bits, BitsAlias, BitsFun, FidxTable};
pub use error::CoreError;
pub use flow::{Flow, FltB, IntB, Obj, StrB, Tfp, Tmp};
pub use mem::TypeMem;
