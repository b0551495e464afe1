mod exchange_context;
mod upstream;

pub use exchange_context::ExchangeContext;
pub use upstream::{Upstream, UpstreamStatistics};
