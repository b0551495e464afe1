pub mod factory;
pub mod generic;
pub mod registry;

pub use factory::UpstreamFactory;
pub use generic::GenericUpstream;
pub use registry::UpstreamRegistry;
