//! 错误定义

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UsbModeError {
    #[error("D-Bus error: {0}")]
    Bus(#[from] zbus::Error),

    #[error("D-Bus fdo error: {0}")]
    Fdo(#[from] zbus::fdo::Error),

    #[error("Not connected to usb_moded")]
    NotConnected,

    #[error("Client closed")]
    ClientClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// 单次远程调用失败（daemon 返回错误而不是值）
///
/// 只记录日志，不会越过 proxy 边界；hide/unhide 失败除外，
/// 它们会变成带错误文本的失败事件。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{name}: {message}")]
pub struct CallError {
    /// D-Bus 错误名，例如 `org.freedesktop.DBus.Error.Failed`
    pub name: String,
    pub message: String,
}

impl CallError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<zbus::Error> for CallError {
    fn from(e: zbus::Error) -> Self {
        match e {
            zbus::Error::MethodError(name, message, _) => Self {
                name: name.to_string(),
                message: message.unwrap_or_default(),
            },
            other => Self {
                name: "org.freedesktop.DBus.Error.Failed".to_string(),
                message: other.to_string(),
            },
        }
    }
}
