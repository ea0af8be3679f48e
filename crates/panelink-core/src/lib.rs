//! # panelink Core Library
//!
//! Host side of the serial link to a panelink companion panel (a small
//! display with buttons).

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial port discovery and the version handshake
//! - Line-delimited JSON framing
//! - Request/response correlation by `<event>_return` naming
//! - Event streams with fan-out to any number of subscribers
//! - Typed panel commands (dialogs, menus, text input)
//!
//! ## Example
//!
//! ```rust,ignore
//! use panelink_core::device::{Panel, SelectList};
//! use panelink_core::protocol::ConnectionConfig;
//!
//! let panel = Panel::new(ConnectionConfig::default());
//! // Probe every serial port for a panel
//! if panel.init(None, 115200).await {
//!     let list = SelectList {
//!         title: "Menu".into(),
//!         options: vec!["Set Wifi".into(), "IP Address".into()],
//!         ..Default::default()
//!     };
//!     let choice = panel.select_list(&list).await?;
//! }
//! ```

pub mod device;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::device::{Dialog, InputText, Panel, SelectList, SelectMenu};
    pub use crate::protocol::{
        Connection, ConnectionConfig, ConnectionState, EventStream, Message, ProtocolError,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
