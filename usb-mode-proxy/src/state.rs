//! Proxy 状态记录
//!
//! 保存每个属性最后一次已知的值，以及初始同步中尚未返回的调用

use serde::{Deserialize, Serialize};

use crate::events::SetupCall;

/// 模式列表的分隔符
pub const MODE_SEPARATOR: char = ',';

/// 解析逗号分隔的模式列表
///
/// 去掉首尾空白和空元素，按首次出现的顺序去重（重复项直接跳过，不移动）。
pub fn parse_mode_list(modes: &str) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    for mode in modes.split(MODE_SEPARATOR).map(str::trim) {
        if mode.is_empty() || result.iter().any(|m| m == mode) {
            continue;
        }
        result.push(mode.to_string());
    }
    result
}

/// 初始查询中尚未返回的调用集合
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCalls(u8);

impl PendingCalls {
    pub fn from_calls(calls: &[SetupCall]) -> Self {
        Self(calls.iter().fold(0, |mask, call| mask | call.bit()))
    }

    pub fn contains(&self, call: SetupCall) -> bool {
        self.0 & call.bit() != 0
    }

    /// 清除一个调用，返回它之前是否处于等待中
    pub fn finish(&mut self, call: SetupCall) -> bool {
        let was_pending = self.contains(call);
        self.0 &= !call.bit();
        was_pending
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }
}

/// 对外可读的属性快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySnapshot {
    pub available: bool,
    pub current_mode: String,
    pub target_mode: String,
    pub config_mode: String,
    pub supported_modes: Vec<String>,
    pub available_modes: Vec<String>,
    pub hidden_modes: Vec<String>,
}

/// 可变状态，只在 proxy 自己的事件处理中修改
#[derive(Debug, Default)]
pub(crate) struct ProxyState {
    pub current_mode: String,
    pub target_mode: String,
    pub config_mode: String,
    pub supported_modes: Vec<String>,
    pub available_modes: Vec<String>,
    pub hidden_modes: Vec<String>,
    pub available: bool,
    pub pending: PendingCalls,
}

impl ProxyState {
    pub fn snapshot(&self) -> ProxySnapshot {
        ProxySnapshot {
            available: self.available,
            current_mode: self.current_mode.clone(),
            target_mode: self.target_mode.clone(),
            config_mode: self.config_mode.clone(),
            supported_modes: self.supported_modes.clone(),
            available_modes: self.available_modes.clone(),
            hidden_modes: self.hidden_modes.clone(),
        }
    }
}

/// 值不同才覆盖，返回是否发生了变化
pub(crate) fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode_list() {
        assert_eq!(parse_mode_list("a, b,a , ,c"), vec!["a", "b", "c"]);
        assert_eq!(
            parse_mode_list("mtp_mode,developer_mode, mtp_mode"),
            vec!["mtp_mode", "developer_mode"]
        );
    }

    #[test]
    fn test_parse_mode_list_empty() {
        assert!(parse_mode_list("").is_empty());
        assert!(parse_mode_list(" , ,,").is_empty());
    }

    #[test]
    fn test_parse_mode_list_keeps_first_occurrence() {
        assert_eq!(parse_mode_list("c,b,a,b,c"), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_pending_calls() {
        let mut pending = PendingCalls::from_calls(&SetupCall::CURRENT);
        assert_eq!(pending.len(), 6);
        assert!(pending.contains(SetupCall::GetHidden));

        assert!(pending.finish(SetupCall::GetHidden));
        assert!(!pending.finish(SetupCall::GetHidden));
        assert_eq!(pending.len(), 5);

        pending.clear();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_replace_if_changed() {
        let mut value = String::from("a");
        assert!(!replace_if_changed(&mut value, "a".to_string()));
        assert!(replace_if_changed(&mut value, "b".to_string()));
        assert_eq!(value, "b");
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = ProxySnapshot {
            available: true,
            current_mode: "mtp_mode".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["available"], true);
        assert_eq!(json["currentMode"], "mtp_mode");
        assert!(json["supportedModes"].as_array().unwrap().is_empty());
    }
}
