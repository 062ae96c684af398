//! Request routing and the asset bundles it produces.
//!
//! - [`router`]: runs the stages of a request in pipeline order
//! - [`bundle`]: the files a finished request produced

pub mod bundle;
pub mod router;

pub use bundle::AssetBundle;
pub use router::{PipelineEvent, Router, RouterError};
