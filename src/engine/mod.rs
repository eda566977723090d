// Engine orchestration: archive assembly and image materialization.

pub mod assembly;
pub mod docker;
pub mod materializer;

pub use assembly::{ArchiveRequest, ArchiveStream, Assembler, AssemblyError};
pub use docker::{ContainerEngine, DockerEngine, EngineError};
pub use materializer::{ImageMaterializer, MaterializeError};
