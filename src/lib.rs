//! promptforge: prompt-to-asset pipeline.
//!
//! A request names the outputs it wants (texture, depth, normal, mesh). The
//! [`pipeline::Router`] runs the stages those outputs need, in order, through
//! configured backends:
//!   remote HTTP server | local command | Blender | built-in sobel | mock
//!
//! and [`export`] copies the resulting bundle into the output tree.
//! [`segment`] separates an image's foreground from its background.

pub mod batch;
pub mod blender;
pub mod config;
pub mod device;
pub mod export;
pub mod invoker;
pub mod metrics;
pub mod pipeline;
pub mod protocol;
pub mod request;
pub mod segment;
pub mod server;
