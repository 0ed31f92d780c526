//! Codec interface (§4.K): the `extract / upscale / assemble` contract
//! every resource-type collaborator implements, plus the directory
//! conventions a batch run lays files out under. Per-format codec bodies
//! (2DA/ARE/WED/GAM/DLG/CHU) are out of scope; this crate carries only
//! the interface and one minimal 2DA implementation to exercise the
//! resource layer, scheduler, and upscaler service end to end.

pub mod codec;
pub mod table;
pub mod twoda;

pub use codec::{Codec, WorkDirs};
pub use table::TwoDaTable;
pub use twoda::TwoDaCodec;
