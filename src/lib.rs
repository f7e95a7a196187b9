//! Lists the name, precision and shape of every tensor in `.safetensors`
//! files and PyTorch `.ckpt` checkpoints without loading tensor data.

pub mod checkpoint;
pub mod extract;
pub mod model;
pub mod report;
pub mod safetensors;
pub mod storage;

pub use extract::{ExtractError, Format, extract, extract_all};
pub use model::{HasDtypeAndShape, TensorRecord, TensorTy};
