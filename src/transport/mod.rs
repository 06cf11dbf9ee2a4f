pub mod grpc;
pub mod http;
pub mod mqtt;
pub mod traits;

pub use grpc::GrpcListener;
pub use http::HttpListener;
pub use mqtt::{MqttListener, MqttSettings};
pub use traits::{Listener, ListenerControl};
