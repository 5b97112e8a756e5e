//! usb_moded proxy 状态机
//!
//! 不做任何 I/O：调用方把服务出现/消失、调用完成、daemon 广播依次喂进来，
//! proxy 更新缓存的属性并返回需要发布的事件。
//!
//! 生命周期：
//! - `Disconnected`：总线上没有 usb_moded
//! - `Connecting`：服务出现，初始查询已发出，仍有调用未返回
//! - `Ready`：所有初始查询都已返回（成功或失败都算），`available = true`
//!
//! 每次建立新的接口句柄都会分配一个新的 [`Generation`]。调用和广播都带着
//! 发出时的代号回来，代号不是当前句柄的一律丢弃，旧句柄上未完成的调用
//! 因此不会再改动状态。

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::CallError;
use crate::events::{DaemonSignal, Mutation, ProxyEvent, SetupCall};
use crate::mode::{ModeVocabulary, ProtocolRevision};
use crate::state::{parse_mode_list, replace_if_changed, PendingCalls, ProxySnapshot, ProxyState};

/// 配置广播中表示默认模式的 section / key (usb_moded-config.h)
pub const USB_MODE_SECTION: &str = "usbmode";
pub const USB_MODE_KEY_MODE: &str = "mode";

/// 接口句柄代号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 服务出现后需要执行的初始化
#[derive(Debug)]
pub struct Setup {
    /// 新接口句柄的代号，之后的调用和广播都要带上它
    pub generation: Generation,
    /// 需要发出的初始查询
    pub calls: &'static [SetupCall],
    /// 替换旧句柄时产生的事件（例如 `AvailableChanged(false)`）
    pub events: Vec<ProxyEvent>,
}

/// usb_moded 客户端状态
#[derive(Debug)]
pub struct ModeProxy {
    vocabulary: ModeVocabulary,
    state: ProxyState,
    /// 当前活动句柄，None 表示没有连接
    handle: Option<Generation>,
    next_generation: u64,
}

impl ModeProxy {
    pub fn new() -> Self {
        Self::with_revision(ProtocolRevision::default())
    }

    pub fn with_revision(revision: ProtocolRevision) -> Self {
        Self {
            vocabulary: ModeVocabulary::new(revision),
            state: ProxyState::default(),
            handle: None,
            next_generation: 1,
        }
    }

    pub fn vocabulary(&self) -> &ModeVocabulary {
        &self.vocabulary
    }

    pub fn available(&self) -> bool {
        self.state.available
    }

    pub fn current_mode(&self) -> &str {
        &self.state.current_mode
    }

    pub fn target_mode(&self) -> &str {
        &self.state.target_mode
    }

    pub fn config_mode(&self) -> &str {
        &self.state.config_mode
    }

    pub fn supported_modes(&self) -> &[String] {
        &self.state.supported_modes
    }

    pub fn available_modes(&self) -> &[String] {
        &self.state.available_modes
    }

    pub fn hidden_modes(&self) -> &[String] {
        &self.state.hidden_modes
    }

    pub fn pending_calls(&self) -> PendingCalls {
        self.state.pending
    }

    /// 当前活动句柄的代号
    pub fn generation(&self) -> Option<Generation> {
        self.handle
    }

    pub fn is_live(&self) -> bool {
        self.handle.is_some()
    }

    pub fn snapshot(&self) -> ProxySnapshot {
        self.state.snapshot()
    }

    fn is_current(&self, generation: Generation) -> bool {
        self.handle == Some(generation)
    }

    // ==================== 服务生命周期 ====================

    /// 服务出现：丢弃旧句柄，分配新代号，重置等待中的初始查询
    pub fn service_registered(&mut self) -> Setup {
        let mut events = Vec::new();

        if let Some(old) = self.handle.take() {
            debug!("[ModeProxy] Replacing interface handle {}", old);
        }
        // 新连接周期内 available 只能从 false 变为 true 一次
        if self.state.available {
            self.state.available = false;
            events.push(ProxyEvent::AvailableChanged(false));
        }

        let generation = Generation(self.next_generation);
        self.next_generation += 1;
        self.handle = Some(generation);

        let calls = SetupCall::batch(self.vocabulary.revision());
        self.state.pending = PendingCalls::from_calls(calls);

        info!(
            "[ModeProxy] usb_moded registered, handle {} issuing {} setup calls",
            generation,
            calls.len()
        );

        Setup {
            generation,
            calls,
            events,
        }
    }

    /// 服务消失：清空等待中的调用，释放句柄；属性保留最后已知的值
    pub fn service_unregistered(&mut self) -> Vec<ProxyEvent> {
        let mut events = Vec::new();

        match self.handle.take() {
            Some(generation) => info!("[ModeProxy] usb_moded unregistered, dropping handle {}", generation),
            None => debug!("[ModeProxy] usb_moded unregistered while not connected"),
        }
        self.state.pending.clear();

        if self.state.available {
            self.state.available = false;
            events.push(ProxyEvent::AvailableChanged(false));
        }
        events
    }

    // ==================== 调用完成 ====================

    /// 初始查询返回
    ///
    /// 失败的调用不会修改对应属性，但同样算作"已完成"。
    pub fn setup_call_finished(
        &mut self,
        generation: Generation,
        call: SetupCall,
        result: Result<String, CallError>,
    ) -> Vec<ProxyEvent> {
        let mut events = Vec::new();

        if !self.is_current(generation) {
            debug!(
                "[ModeProxy] Ignoring {} reply from stale handle {}",
                call.method(),
                generation
            );
            return events;
        }

        match result {
            Ok(value) => {
                debug!("[ModeProxy] {} -> {:?}", call.method(), value);
                self.apply_setup_value(call, value, &mut events);
            }
            Err(e) => warn!("[ModeProxy] {} failed: {}", call.method(), e),
        }

        let was_pending = self.state.pending.finish(call);
        debug_assert!(was_pending, "{} finished twice", call.method());

        if was_pending && self.state.pending.is_empty() {
            debug!("[ModeProxy] Setup done");
            debug_assert!(!self.state.available, "available set twice");
            if !self.state.available {
                self.state.available = true;
                events.push(ProxyEvent::AvailableChanged(true));
            }
        }
        events
    }

    fn apply_setup_value(&mut self, call: SetupCall, value: String, events: &mut Vec<ProxyEvent>) {
        match call {
            SetupCall::GetModes => self.update_supported_modes(&value, events),
            SetupCall::GetAvailableModes => self.update_available_modes(&value, events),
            SetupCall::GetConfig => self.update_config_mode(value, events),
            SetupCall::GetTargetState => self.update_target_mode(value, events),
            SetupCall::ModeRequest => self.update_current_mode(value, events),
            SetupCall::GetHidden => self.update_hidden_modes(&value, events),
        }
    }

    /// 发起修改请求前检查连接，返回请求要绑定的句柄代号
    ///
    /// 返回 None 表示 daemon 不在，请求无法发出。
    pub fn request(&self, mutation: &Mutation) -> Option<Generation> {
        match self.handle {
            Some(generation) => {
                debug!(
                    "[ModeProxy] {}({}) on handle {}",
                    mutation.method(),
                    mutation.mode(),
                    generation
                );
                Some(generation)
            }
            None => {
                debug!(
                    "[ModeProxy] {}({}) rejected, usb_moded not connected",
                    mutation.method(),
                    mutation.mode()
                );
                None
            }
        }
    }

    /// 修改请求返回
    ///
    /// `set_mode` 的返回值不代表模式已经切换：daemon 可能因为激活失败而
    /// 落到其他模式（例如仅充电）。当前模式只由 `sig_usb_state_ind` 更新。
    pub fn mutation_finished(
        &mut self,
        generation: Generation,
        mutation: &Mutation,
        result: Result<String, CallError>,
    ) -> Vec<ProxyEvent> {
        let mut events = Vec::new();

        if !self.is_current(generation) {
            debug!(
                "[ModeProxy] Ignoring {} reply from stale handle {}",
                mutation.method(),
                generation
            );
            return events;
        }

        match (mutation, result) {
            (Mutation::SetMode(requested), Ok(reply)) => {
                if reply == *requested {
                    debug!("[ModeProxy] set_mode({}) accepted", requested);
                } else {
                    info!(
                        "[ModeProxy] set_mode({}) answered with {:?}, waiting for state signal",
                        requested, reply
                    );
                }
            }
            (Mutation::SetConfig(_), Ok(reply)) => {
                debug!("[ModeProxy] set_config -> {:?}", reply);
                self.update_config_mode(reply, &mut events);
            }
            (Mutation::HideMode(mode), Ok(_)) => debug!("[ModeProxy] hide_mode({}) done", mode),
            (Mutation::UnhideMode(mode), Ok(_)) => debug!("[ModeProxy] unhide_mode({}) done", mode),
            (Mutation::HideMode(mode), Err(e)) => {
                warn!("[ModeProxy] hide_mode({}) failed: {}", mode, e);
                events.push(ProxyEvent::HideModeFailed {
                    mode: mode.clone(),
                    error: e.message,
                });
            }
            (Mutation::UnhideMode(mode), Err(e)) => {
                warn!("[ModeProxy] unhide_mode({}) failed: {}", mode, e);
                events.push(ProxyEvent::UnhideModeFailed {
                    mode: mode.clone(),
                    error: e.message,
                });
            }
            (m, Err(e)) => warn!("[ModeProxy] {}({}) failed: {}", m.method(), m.mode(), e),
        }
        events
    }

    // ==================== daemon 广播 ====================

    pub fn signal(&mut self, generation: Generation, signal: DaemonSignal) -> Vec<ProxyEvent> {
        let mut events = Vec::new();

        if !self.is_current(generation) {
            debug!("[ModeProxy] Ignoring {:?} from stale handle {}", signal, generation);
            return events;
        }
        if !self.supports(&signal) {
            debug!(
                "[ModeProxy] Ignoring {:?}, not part of protocol revision {}",
                signal,
                self.vocabulary.revision().as_str()
            );
            return events;
        }

        match signal {
            DaemonSignal::StateChanged(mode) => {
                debug!("[ModeProxy] State: {}", mode);
                self.check_known(&mode);
                self.update_current_mode(mode, &mut events);
            }
            DaemonSignal::TargetStateChanged(mode) => {
                debug!("[ModeProxy] Target state: {}", mode);
                self.check_known(&mode);
                self.update_target_mode(mode, &mut events);
            }
            DaemonSignal::Event(event) => {
                debug!("[ModeProxy] Event: {}", event);
                if !self.vocabulary.is_event(&event) {
                    warn!("[ModeProxy] Unrecognized usb_moded event {:?}", event);
                }
                events.push(ProxyEvent::UsbEvent(event));
            }
            DaemonSignal::ConfigChanged { section, key, value } => {
                debug!("[ModeProxy] Config: [{}] {} = {}", section, key, value);
                if section == USB_MODE_SECTION && key == USB_MODE_KEY_MODE {
                    self.update_config_mode(value, &mut events);
                }
            }
            DaemonSignal::SupportedModesChanged(modes) => {
                self.update_supported_modes(&modes, &mut events)
            }
            DaemonSignal::AvailableModesChanged(modes) => {
                self.update_available_modes(&modes, &mut events)
            }
            DaemonSignal::HiddenModesChanged(modes) => self.update_hidden_modes(&modes, &mut events),
            DaemonSignal::StateError(error) => {
                warn!("[ModeProxy] usb_moded state error: {}", error);
                events.push(ProxyEvent::UsbStateError(error));
            }
        }
        events
    }

    /// 旧版协议没有目标状态和通用事件广播
    fn supports(&self, signal: &DaemonSignal) -> bool {
        match self.vocabulary.revision() {
            ProtocolRevision::Legacy => !matches!(
                signal,
                DaemonSignal::TargetStateChanged(_) | DaemonSignal::Event(_)
            ),
            ProtocolRevision::Current => true,
        }
    }

    /// 既不是已知事件也不是已知状态时提示运维
    fn check_known(&self, mode: &str) {
        if !self.vocabulary.is_known(mode) {
            warn!(
                "[ModeProxy] Unrecognized mode {:?} for protocol revision {}",
                mode,
                self.vocabulary.revision().as_str()
            );
        }
    }

    // ==================== 属性更新 ====================

    fn update_current_mode(&mut self, mode: String, events: &mut Vec<ProxyEvent>) {
        if replace_if_changed(&mut self.state.current_mode, mode) {
            events.push(ProxyEvent::CurrentModeChanged(self.state.current_mode.clone()));
        }
    }

    fn update_target_mode(&mut self, mode: String, events: &mut Vec<ProxyEvent>) {
        if replace_if_changed(&mut self.state.target_mode, mode) {
            events.push(ProxyEvent::TargetModeChanged(self.state.target_mode.clone()));
        }
    }

    fn update_config_mode(&mut self, mode: String, events: &mut Vec<ProxyEvent>) {
        if replace_if_changed(&mut self.state.config_mode, mode) {
            events.push(ProxyEvent::ConfigModeChanged(self.state.config_mode.clone()));
        }
    }

    fn update_supported_modes(&mut self, modes: &str, events: &mut Vec<ProxyEvent>) {
        if replace_if_changed(&mut self.state.supported_modes, parse_mode_list(modes)) {
            events.push(ProxyEvent::SupportedModesChanged(self.state.supported_modes.clone()));
        }
    }

    fn update_available_modes(&mut self, modes: &str, events: &mut Vec<ProxyEvent>) {
        if replace_if_changed(&mut self.state.available_modes, parse_mode_list(modes)) {
            events.push(ProxyEvent::AvailableModesChanged(self.state.available_modes.clone()));
        }
    }

    fn update_hidden_modes(&mut self, modes: &str, events: &mut Vec<ProxyEvent>) {
        if replace_if_changed(&mut self.state.hidden_modes, parse_mode_list(modes)) {
            events.push(ProxyEvent::HiddenModesChanged(self.state.hidden_modes.clone()));
        }
    }
}

impl Default for ModeProxy {
    fn default() -> Self {
        Self::new()
    }
}
