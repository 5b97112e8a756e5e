//! usb_moded 客户端代理
//!
//! 跟踪 usb_moded 的 USB 模式状态：服务上线后批量查询初始值，
//! 之后根据 daemon 广播更新，并把属性变化以事件形式发布

mod backend;
mod client;
mod dbus;
mod error;
mod events;
pub mod mode;
mod proxy;
mod state;

pub use backend::{Backend, RemoteInterface};
pub use client::{BusType, UsbModeClient, UsbModeConfig};
pub use dbus::{DbusBackend, UsbModedProxy, USB_MODE_INTERFACE, USB_MODE_OBJECT, USB_MODE_SERVICE};
pub use error::{CallError, UsbModeError};
pub use events::{DaemonCall, DaemonSignal, Mutation, Presence, ProxyEvent, SetupCall};
pub use mode::{ModeKind, ModeVocabulary, ProtocolRevision, DEFAULT_VOCABULARY};
pub use proxy::{Generation, ModeProxy, Setup, USB_MODE_KEY_MODE, USB_MODE_SECTION};
pub use state::{parse_mode_list, PendingCalls, ProxySnapshot, MODE_SEPARATOR};
