pub mod http;
pub mod mock;
pub mod provider;
pub mod wire;

pub use http::HttpProvider;
pub use mock::{MockProvider, MockResponse};
pub use provider::{ChatProvider, ChunkStream, ProviderRequest, StreamOptions, ToolChoice};
pub use wire::WireFormat;
