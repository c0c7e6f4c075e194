#![warn(missing_docs)]

//! SteamCM client subsystem: callback dispatcher, message handler interface, client facade
//!
//! Inbound: connection worker → built-in session handlers → registered MessageHandlers →
//! CallbackManager queue → application pump

pub mod callback;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod msg;

pub use callback::{CallbackManager, Subscription};
pub use client::{CmClient, CmClientBuilder, CmListCallback, ConnectedCallback, DisconnectedCallback};
pub use config::{ClientConfig, ServerListSource};
pub use error::{BoxError, ClientError, DispatchError, FailureKind, HandlerFailure, Result};
pub use handler::{HandlerContext, MessageHandler};
pub use msg::ProtoMsg;
