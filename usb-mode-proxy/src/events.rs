//! 事件与调用定义
//!
//! 定义 proxy 与 usb_moded 之间的调用、广播，以及 proxy 对外发布的事件

use serde::{Deserialize, Serialize};

use crate::mode::ProtocolRevision;

// ==================== 下行调用 (Proxy → usb_moded) ====================

/// 建立连接后立即发出的初始查询
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupCall {
    /// `get_modes`
    GetModes,
    /// `get_available_modes_for_user`
    GetAvailableModes,
    /// `get_config`
    GetConfig,
    /// `get_target_state`
    GetTargetState,
    /// `mode_request`，即当前模式
    ModeRequest,
    /// `get_hidden`
    GetHidden,
}

impl SetupCall {
    pub const CURRENT: [SetupCall; 6] = [
        SetupCall::GetModes,
        SetupCall::GetAvailableModes,
        SetupCall::GetConfig,
        SetupCall::GetTargetState,
        SetupCall::ModeRequest,
        SetupCall::GetHidden,
    ];

    pub const LEGACY: [SetupCall; 3] = [
        SetupCall::GetModes,
        SetupCall::GetConfig,
        SetupCall::ModeRequest,
    ];

    /// 指定协议版本的初始查询批次
    pub fn batch(revision: ProtocolRevision) -> &'static [SetupCall] {
        match revision {
            ProtocolRevision::Legacy => &Self::LEGACY,
            ProtocolRevision::Current => &Self::CURRENT,
        }
    }

    pub(crate) fn bit(&self) -> u8 {
        match self {
            Self::GetModes => 0x01,
            Self::GetAvailableModes => 0x02,
            Self::GetConfig => 0x04,
            Self::GetTargetState => 0x08,
            Self::ModeRequest => 0x10,
            Self::GetHidden => 0x20,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::GetModes => "get_modes",
            Self::GetAvailableModes => "get_available_modes_for_user",
            Self::GetConfig => "get_config",
            Self::GetTargetState => "get_target_state",
            Self::ModeRequest => "mode_request",
            Self::GetHidden => "get_hidden",
        }
    }
}

/// 用户发起的修改请求（fire-and-forget）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Mutation {
    SetMode(String),
    SetConfig(String),
    HideMode(String),
    UnhideMode(String),
}

impl Mutation {
    pub fn method(&self) -> &'static str {
        match self {
            Self::SetMode(_) => "set_mode",
            Self::SetConfig(_) => "set_config",
            Self::HideMode(_) => "hide_mode",
            Self::UnhideMode(_) => "unhide_mode",
        }
    }

    pub fn mode(&self) -> &str {
        match self {
            Self::SetMode(m) | Self::SetConfig(m) | Self::HideMode(m) | Self::UnhideMode(m) => m,
        }
    }
}

/// 发往 daemon 的一次方法调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonCall {
    Setup(SetupCall),
    Mutation(Mutation),
}

impl DaemonCall {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Setup(call) => call.method(),
            Self::Mutation(m) => m.method(),
        }
    }
}

// ==================== 上行广播 (usb_moded → Proxy) ====================

/// daemon 主动发出的广播
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonSignal {
    /// `sig_usb_state_ind`
    StateChanged(String),
    /// `sig_usb_target_state_ind`
    TargetStateChanged(String),
    /// `sig_usb_event_ind`
    Event(String),
    /// `sig_usb_config_ind`
    ConfigChanged {
        section: String,
        key: String,
        value: String,
    },
    /// `sig_usb_supported_modes_ind`
    SupportedModesChanged(String),
    /// `sig_usb_available_modes_ind`
    AvailableModesChanged(String),
    /// `sig_usb_hidden_modes_ind`
    HiddenModesChanged(String),
    /// `sig_usb_state_error_ind`
    StateError(String),
}

/// 服务在总线上的出现与消失
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Registered,
    Unregistered,
}

// ==================== 对外事件 (Proxy → 调用方) ====================

/// 属性变化通知与错误信号
///
/// 只有值真正变化时才会发出属性变化通知。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ProxyEvent {
    AvailableChanged(bool),
    CurrentModeChanged(String),
    TargetModeChanged(String),
    ConfigModeChanged(String),
    SupportedModesChanged(Vec<String>),
    AvailableModesChanged(Vec<String>),
    HiddenModesChanged(Vec<String>),
    /// 瞬时事件，例如 "USB connected"
    UsbEvent(String),
    UsbStateError(String),
    HideModeFailed { mode: String, error: String },
    UnhideModeFailed { mode: String, error: String },
}

impl ProxyEvent {
    /// 事件名（日志与 CLI 输出用）
    pub fn name(&self) -> &'static str {
        match self {
            Self::AvailableChanged(_) => "availableChanged",
            Self::CurrentModeChanged(_) => "currentModeChanged",
            Self::TargetModeChanged(_) => "targetModeChanged",
            Self::ConfigModeChanged(_) => "configModeChanged",
            Self::SupportedModesChanged(_) => "supportedModesChanged",
            Self::AvailableModesChanged(_) => "availableModesChanged",
            Self::HiddenModesChanged(_) => "hiddenModesChanged",
            Self::UsbEvent(_) => "usbEvent",
            Self::UsbStateError(_) => "usbStateError",
            Self::HideModeFailed { .. } => "hideModeFailed",
            Self::UnhideModeFailed { .. } => "unhideModeFailed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::UsbStateError(_) | Self::HideModeFailed { .. } | Self::UnhideModeFailed { .. }
        )
    }
}
