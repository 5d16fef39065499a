//! Assistant tool platform.
//!
//! Lets a conversational assistant invoke local capabilities as callable
//! functions: document analysis, image generation, translation, QR codes and
//! engineering calculators. Long operations run as background jobs with
//! progress streamed to the owning session over WebSocket.

pub mod cli;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod plugins;
pub mod registry;
pub mod server;
pub mod session;
pub mod settings;
pub mod telemetry;

pub use dispatcher::{DispatchResult, Dispatcher, FunctionCall};
pub use error::ToolError;
pub use executor::{ExecutorConfig, JobExecutor, JobStatus};
pub use gateway::EventGateway;
pub use registry::{Plugin, PluginDescriptor, Registry};
pub use session::SessionManager;
pub use settings::Settings;
