//! USB 模式词汇表
//!
//! usb_moded 通过 `sig_usb_state_ind` 广播的字符串分为两类：
//! - "事件"：只会出现在广播里，永远不会作为 `mode_request()` 的返回值
//! - "状态"：可以作为查询结果返回；集合由 daemon 的配置文件决定，
//!   所以这里唯一能做的假设是：不是事件的就是状态
//!
//! 事件集合在 usb_moded 中是写死的，并且随协议版本变化。

use serde::{Deserialize, Serialize};

// ==================== 事件 (usb_moded-dbus.h) ====================

pub const CONNECTED: &str = "USB connected";
pub const DATA_IN_USE: &str = "data_in_use";
pub const DISCONNECTED: &str = "USB disconnected";
pub const MODE_REQUEST: &str = "mode_requested_show_dialog";
pub const PRE_UNMOUNT: &str = "pre-unmount";
pub const RE_MOUNT_FAILED: &str = "mount_failed";
pub const MODE_SETTING_FAILED: &str = "mode_setting_failed";
pub const CHARGER_CONNECTED: &str = "charger_connected";
pub const CHARGER_DISCONNECTED: &str = "charger_disconnected";

// ==================== 状态 (usb_moded-modes.h) ====================

pub const UNDEFINED: &str = "undefined";
pub const ASK: &str = "ask";
pub const MASS_STORAGE: &str = "mass_storage";
pub const DEVELOPER: &str = "developer_mode";
pub const MTP: &str = "mtp_mode";
pub const HOST: &str = "host_mode";
pub const CONNECTION_SHARING: &str = "connection_sharing";
pub const DIAG: &str = "diag_mode";
pub const ADB: &str = "adb_mode";
pub const PC_SUITE: &str = "pc_suite";
pub const CHARGING: &str = "charging_only";
pub const CHARGER: &str = "dedicated_charger";
pub const CHARGING_FALLBACK: &str = "charging_only_fallback";
pub const BUSY: &str = "busy";

const LEGACY_EVENTS: &[&str] = &[CONNECTED, DATA_IN_USE, DISCONNECTED, MODE_REQUEST];

const CURRENT_EVENTS: &[&str] = &[
    CONNECTED,
    DATA_IN_USE,
    DISCONNECTED,
    MODE_REQUEST,
    PRE_UNMOUNT,
    RE_MOUNT_FAILED,
    MODE_SETTING_FAILED,
    CHARGER_CONNECTED,
    CHARGER_DISCONNECTED,
];

/// 已知的状态。状态集合是开放的，这里只用于提示运维出现了陌生的 token
const KNOWN_STATES: &[&str] = &[
    UNDEFINED,
    ASK,
    MASS_STORAGE,
    DEVELOPER,
    MTP,
    HOST,
    CONNECTION_SHARING,
    DIAG,
    ADB,
    PC_SUITE,
    CHARGING,
    CHARGER,
    CHARGING_FALLBACK,
    BUSY,
];

/// Busy: 等待模式切换相关的 usb 重配置完成
/// ChargingFallback: 等待允许选择模式的设备状态（例如解锁）
/// Ask: 等待用户选择模式
const WAITING_STATES: &[&str] = &[BUSY, CHARGING_FALLBACK, ASK];

const DISCONNECTED_STATES: &[&str] = &[DISCONNECTED, CHARGER_DISCONNECTED, UNDEFINED];

fn contains(set: &[&str], mode: &str) -> bool {
    set.iter().any(|m| *m == mode)
}

/// usb_moded D-Bus 协议版本
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolRevision {
    /// 早期版本：4 个事件，没有 target state / event 广播
    Legacy,
    /// 当前版本：9 个事件
    #[default]
    Current,
}

impl ProtocolRevision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Current => "current",
        }
    }
}

impl std::str::FromStr for ProtocolRevision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "current" => Ok(Self::Current),
            other => Err(format!("unknown protocol revision: {}", other)),
        }
    }
}

/// token 的分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Event,
    WaitingState,
    FinalState,
}

/// 按协议版本划分的词汇表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeVocabulary {
    revision: ProtocolRevision,
    events: &'static [&'static str],
}

impl ModeVocabulary {
    pub const fn new(revision: ProtocolRevision) -> Self {
        let events = match revision {
            ProtocolRevision::Legacy => LEGACY_EVENTS,
            ProtocolRevision::Current => CURRENT_EVENTS,
        };
        Self { revision, events }
    }

    pub fn revision(&self) -> ProtocolRevision {
        self.revision
    }

    pub fn events(&self) -> &'static [&'static str] {
        self.events
    }

    pub fn is_event(&self, mode: &str) -> bool {
        contains(self.events, mode)
    }

    pub fn is_state(&self, mode: &str) -> bool {
        !self.is_event(mode)
    }

    pub fn is_waiting_state(&self, mode: &str) -> bool {
        is_waiting_state(mode)
    }

    pub fn is_final_state(&self, mode: &str) -> bool {
        self.is_state(mode) && !is_waiting_state(mode)
    }

    pub fn is_disconnected(&self, mode: &str) -> bool {
        is_disconnected(mode)
    }

    pub fn is_connected(&self, mode: &str) -> bool {
        is_connected(mode)
    }

    pub fn classify(&self, mode: &str) -> ModeKind {
        if self.is_event(mode) {
            ModeKind::Event
        } else if is_waiting_state(mode) {
            ModeKind::WaitingState
        } else {
            ModeKind::FinalState
        }
    }

    /// 是否属于任一已知集合
    pub fn is_known(&self, mode: &str) -> bool {
        self.is_event(mode) || contains(KNOWN_STATES, mode)
    }
}

impl Default for ModeVocabulary {
    fn default() -> Self {
        Self::new(ProtocolRevision::Current)
    }
}

pub const DEFAULT_VOCABULARY: ModeVocabulary = ModeVocabulary::new(ProtocolRevision::Current);

pub fn is_event(mode: &str) -> bool {
    DEFAULT_VOCABULARY.is_event(mode)
}

pub fn is_state(mode: &str) -> bool {
    DEFAULT_VOCABULARY.is_state(mode)
}

pub fn is_waiting_state(mode: &str) -> bool {
    contains(WAITING_STATES, mode)
}

pub fn is_final_state(mode: &str) -> bool {
    DEFAULT_VOCABULARY.is_final_state(mode)
}

pub fn is_disconnected(mode: &str) -> bool {
    contains(DISCONNECTED_STATES, mode)
}

/// busy 既不算连接也不算断开
pub fn is_connected(mode: &str) -> bool {
    !is_disconnected(mode) && mode != BUSY
}

pub fn classify(mode: &str) -> ModeKind {
    DEFAULT_VOCABULARY.classify(mode)
}

pub fn is_known(mode: &str) -> bool {
    DEFAULT_VOCABULARY.is_known(mode)
}
