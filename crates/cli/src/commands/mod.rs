pub mod demo;
pub mod disasm;
pub mod inspect;
pub mod run;
pub mod translate;
pub mod util;

pub use demo::*;
pub use disasm::*;
pub use inspect::*;
pub use run::*;
pub use translate::*;
pub use util::*;
