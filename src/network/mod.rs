pub mod web_server;
pub mod wifi;

pub use web_server::WebServer;
pub use wifi::WifiLink;
