pub mod dead_block;
pub mod irregular;
pub mod lmp;
pub mod offchip;
pub mod routing;

pub use dead_block::DeadBlockPredictor;
pub use irregular::IrregularPredictor;
pub use lmp::LoadMissPredictor;
pub use offchip::OffchipPredictor;
pub use routing::RoutingEngine;
