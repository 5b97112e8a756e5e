//! usb_moded 客户端
//!
//! 一个后台 task 独占 [`ModeProxy`]，按顺序处理服务出现/消失、调用完成、
//! daemon 广播和用户请求，所以状态修改不需要加锁。
//! 属性变化通过 broadcast channel 发布，最新快照通过 watch channel 暴露。

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, RemoteInterface};
use crate::dbus::{DbusBackend, USB_MODE_OBJECT, USB_MODE_SERVICE};
use crate::error::{CallError, UsbModeError};
use crate::events::{DaemonCall, DaemonSignal, Mutation, Presence, ProxyEvent, SetupCall};
use crate::mode::ProtocolRevision;
use crate::proxy::{Generation, ModeProxy};
use crate::state::ProxySnapshot;

/// 总线类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BusType {
    #[default]
    System,
    Session,
}

impl BusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Session => "session",
        }
    }
}

impl std::str::FromStr for BusType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "session" => Ok(Self::Session),
            other => Err(format!("unknown bus type: {}", other)),
        }
    }
}

/// 客户端配置
#[derive(Debug, Clone)]
pub struct UsbModeConfig {
    /// usb_moded 所在的总线
    pub bus: BusType,
    /// 服务名
    pub service: String,
    /// 对象路径
    pub object_path: String,
    /// 协议版本，决定事件集合与初始查询
    pub revision: ProtocolRevision,
    /// 事件广播 channel 容量
    pub event_capacity: usize,
}

impl Default for UsbModeConfig {
    fn default() -> Self {
        // 从环境变量读取配置，默认系统总线上的 com.meego.usb_moded
        let bus = std::env::var("USB_MODED_BUS")
            .ok()
            .and_then(|b| b.parse().ok())
            .unwrap_or_default();
        let service =
            std::env::var("USB_MODED_SERVICE").unwrap_or_else(|_| USB_MODE_SERVICE.to_string());
        let revision = std::env::var("USB_MODED_REVISION")
            .ok()
            .and_then(|r| r.parse().ok())
            .unwrap_or_default();

        Self {
            bus,
            service,
            object_path: USB_MODE_OBJECT.to_string(),
            revision,
            event_capacity: 64,
        }
    }
}

/// 后台 task 的输入
enum Inbound {
    SetupFinished {
        generation: Generation,
        call: SetupCall,
        result: Result<String, CallError>,
    },
    MutationFinished {
        generation: Generation,
        mutation: Mutation,
        result: Result<String, CallError>,
    },
    Signal {
        generation: Generation,
        signal: DaemonSignal,
    },
    Request {
        mutation: Mutation,
        reply: oneshot::Sender<bool>,
    },
}

/// usb_moded 客户端
pub struct UsbModeClient {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    event_tx: broadcast::Sender<ProxyEvent>,
    snapshot_rx: watch::Receiver<ProxySnapshot>,
    task: JoinHandle<()>,
}

impl UsbModeClient {
    /// 连接 D-Bus 并开始跟踪 usb_moded
    pub async fn start(config: UsbModeConfig) -> Result<Self, UsbModeError> {
        let backend = DbusBackend::connect(&config).await?;
        Self::with_backend(backend, &config).await
    }

    /// 使用指定后端启动
    pub async fn with_backend<B: Backend>(
        backend: B,
        config: &UsbModeConfig,
    ) -> Result<Self, UsbModeError> {
        if config.event_capacity == 0 {
            return Err(UsbModeError::InvalidConfig(
                "event_capacity must be greater than 0".to_string(),
            ));
        }

        let presence = backend.presence().await?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let proxy = ModeProxy::with_revision(config.revision);
        let (snapshot_tx, snapshot_rx) = watch::channel(proxy.snapshot());

        let driver = Driver {
            proxy,
            backend: Box::new(backend),
            interface: None,
            signal_task: None,
            inbound_tx: inbound_tx.downgrade(),
            event_tx: event_tx.clone(),
            snapshot_tx,
        };
        let task = tokio::spawn(driver.run(presence, inbound_rx));

        info!(
            "[UsbModeClient] Started (revision: {})",
            config.revision.as_str()
        );

        Ok(Self {
            inbound_tx,
            event_tx,
            snapshot_rx,
            task,
        })
    }

    /// 订阅属性变化与错误事件
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.event_tx.subscribe()
    }

    /// 当前所有属性
    pub fn snapshot(&self) -> ProxySnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// 快照的 watch receiver
    pub fn watch(&self) -> watch::Receiver<ProxySnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn available(&self) -> bool {
        self.snapshot_rx.borrow().available
    }

    pub fn current_mode(&self) -> String {
        self.snapshot_rx.borrow().current_mode.clone()
    }

    pub fn target_mode(&self) -> String {
        self.snapshot_rx.borrow().target_mode.clone()
    }

    pub fn config_mode(&self) -> String {
        self.snapshot_rx.borrow().config_mode.clone()
    }

    pub fn supported_modes(&self) -> Vec<String> {
        self.snapshot_rx.borrow().supported_modes.clone()
    }

    pub fn available_modes(&self) -> Vec<String> {
        self.snapshot_rx.borrow().available_modes.clone()
    }

    pub fn hidden_modes(&self) -> Vec<String> {
        self.snapshot_rx.borrow().hidden_modes.clone()
    }

    /// 等待初始同步完成
    pub async fn wait_available(&self) -> Result<ProxySnapshot, UsbModeError> {
        let mut rx = self.snapshot_rx.clone();
        let snapshot = rx
            .wait_for(|s| s.available)
            .await
            .map_err(|_| UsbModeError::ClientClosed)?;
        Ok(snapshot.clone())
    }

    /// 请求切换当前模式
    ///
    /// 返回 true 只表示请求已发出。模式是否真的切换要看之后的
    /// `CurrentModeChanged`，daemon 可能会落到其他模式。
    pub async fn set_current_mode(&self, mode: &str) -> bool {
        self.request(Mutation::SetMode(mode.to_string())).await
    }

    /// 请求修改默认模式
    pub async fn set_config_mode(&self, mode: &str) -> bool {
        self.request(Mutation::SetConfig(mode.to_string())).await
    }

    /// 请求隐藏模式，失败时发布 `HideModeFailed`
    pub async fn hide_mode(&self, mode: &str) -> bool {
        self.request(Mutation::HideMode(mode.to_string())).await
    }

    /// 请求取消隐藏，失败时发布 `UnhideModeFailed`
    pub async fn unhide_mode(&self, mode: &str) -> bool {
        self.request(Mutation::UnhideMode(mode.to_string())).await
    }

    async fn request(&self, mutation: Mutation) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .inbound_tx
            .send(Inbound::Request { mutation, reply })
            .is_err()
        {
            warn!("[UsbModeClient] Request dropped, client stopped");
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// 停止后台 task
    pub fn shutdown(&self) {
        if !self.task.is_finished() {
            self.task.abort();
            info!("[UsbModeClient] Stopped");
        }
    }
}

impl Drop for UsbModeClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 后台 task 的状态
struct Driver {
    proxy: ModeProxy,
    backend: Box<dyn Backend>,
    interface: Option<Arc<dyn RemoteInterface>>,
    /// 当前句柄的广播转发任务
    signal_task: Option<JoinHandle<()>>,
    /// 只有 client 持有强引用，client 释放后事件循环自然结束
    inbound_tx: mpsc::WeakUnboundedSender<Inbound>,
    event_tx: broadcast::Sender<ProxyEvent>,
    snapshot_tx: watch::Sender<ProxySnapshot>,
}

impl Driver {
    async fn run(
        mut self,
        mut presence: BoxStream<'static, Presence>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) {
        let mut presence_open = true;

        loop {
            tokio::select! {
                item = presence.next(), if presence_open => match item {
                    Some(Presence::Registered) => self.on_service_registered().await,
                    Some(Presence::Unregistered) => self.on_service_unregistered(),
                    None => {
                        warn!("[UsbModeClient] Presence stream closed");
                        presence_open = false;
                    }
                },
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }

        debug!("[UsbModeClient] Event loop finished");
    }

    async fn on_service_registered(&mut self) {
        let interface = match self.backend.open().await {
            Ok(interface) => interface,
            Err(e) => {
                error!("[UsbModeClient] Failed to open usb_moded interface: {}", e);
                self.on_service_unregistered();
                return;
            }
        };

        // 替换句柄，旧句柄上的调用会因为代号不匹配而被丢弃
        self.stop_signal_task();
        let setup = self.proxy.service_registered();
        self.publish(setup.events);
        let generation = setup.generation;

        match interface.signals().await {
            Ok(mut signals) => {
                let weak_tx = self.inbound_tx.clone();
                self.signal_task = Some(tokio::spawn(async move {
                    while let Some(signal) = signals.next().await {
                        let Some(tx) = weak_tx.upgrade() else {
                            break;
                        };
                        if tx.send(Inbound::Signal { generation, signal }).is_err() {
                            break;
                        }
                    }
                }));
            }
            Err(e) => warn!("[UsbModeClient] Failed to subscribe to usb_moded signals: {}", e),
        }

        for call in setup.calls {
            let Some(tx) = self.inbound_tx.upgrade() else {
                return;
            };
            let call = *call;
            let pending = interface.call(DaemonCall::Setup(call));
            tokio::spawn(async move {
                let result = pending.await;
                let _ = tx.send(Inbound::SetupFinished {
                    generation,
                    call,
                    result,
                });
            });
        }

        self.interface = Some(interface);
    }

    fn on_service_unregistered(&mut self) {
        self.stop_signal_task();
        self.interface = None;
        let events = self.proxy.service_unregistered();
        self.publish(events);
    }

    fn handle(&mut self, msg: Inbound) {
        match msg {
            Inbound::SetupFinished {
                generation,
                call,
                result,
            } => {
                let events = self.proxy.setup_call_finished(generation, call, result);
                self.publish(events);
            }
            Inbound::MutationFinished {
                generation,
                mutation,
                result,
            } => {
                let events = self.proxy.mutation_finished(generation, &mutation, result);
                self.publish(events);
            }
            Inbound::Signal { generation, signal } => {
                let events = self.proxy.signal(generation, signal);
                self.publish(events);
            }
            Inbound::Request { mutation, reply } => {
                let accepted = self.dispatch(mutation);
                let _ = reply.send(accepted);
            }
        }
    }

    /// 发出修改请求，没有活动句柄时返回 false
    fn dispatch(&mut self, mutation: Mutation) -> bool {
        let (Some(generation), Some(interface)) = (self.proxy.request(&mutation), &self.interface)
        else {
            return false;
        };

        let Some(tx) = self.inbound_tx.upgrade() else {
            return false;
        };
        let pending = interface.call(DaemonCall::Mutation(mutation.clone()));
        tokio::spawn(async move {
            let result = pending.await;
            let _ = tx.send(Inbound::MutationFinished {
                generation,
                mutation,
                result,
            });
        });
        true
    }

    fn publish(&mut self, events: Vec<ProxyEvent>) {
        if events.is_empty() {
            return;
        }
        // 先更新快照，收到事件的订阅者读到的就是新值
        self.snapshot_tx.send_replace(self.proxy.snapshot());
        for event in events {
            debug!("[UsbModeClient] {} {:?}", event.name(), event);
            // 没有订阅者时发送失败，忽略
            let _ = self.event_tx.send(event);
        }
    }

    fn stop_signal_task(&mut self) {
        if let Some(handle) = self.signal_task.take() {
            handle.abort();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // 事件循环被 abort 时同样停掉转发任务
        self.stop_signal_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn channel_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) }).boxed()
    }

    /// 内存中的 usb_moded
    #[derive(Default)]
    struct FakeInterface {
        replies: Mutex<HashMap<&'static str, Result<String, CallError>>>,
        calls: Mutex<Vec<DaemonCall>>,
        signal_tx: Mutex<Option<mpsc::UnboundedSender<DaemonSignal>>>,
    }

    impl FakeInterface {
        fn with_defaults() -> Self {
            let fake = Self::default();
            fake.reply("get_modes", Ok("mtp_mode,developer_mode,charging_only".to_string()));
            fake.reply("get_available_modes_for_user", Ok("mtp_mode,charging_only".to_string()));
            fake.reply("get_config", Ok(mode::ASK.to_string()));
            fake.reply("get_target_state", Ok(mode::MTP.to_string()));
            fake.reply("mode_request", Ok(mode::MTP.to_string()));
            fake.reply("get_hidden", Ok(String::new()));
            fake
        }

        fn reply(&self, method: &'static str, result: Result<String, CallError>) {
            self.replies.lock().unwrap().insert(method, result);
        }

        fn emit(&self, signal: DaemonSignal) {
            let guard = self.signal_tx.lock().unwrap();
            guard.as_ref().expect("not subscribed").send(signal).unwrap();
        }

        fn methods(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().iter().map(|c| c.method()).collect()
        }
    }

    impl RemoteInterface for Arc<FakeInterface> {
        fn call(&self, call: DaemonCall) -> BoxFuture<'static, Result<String, CallError>> {
            let result = self
                .replies
                .lock()
                .unwrap()
                .get(call.method())
                .cloned()
                .unwrap_or_else(|| Err(CallError::new("org.freedesktop.DBus.Error.UnknownMethod", call.method())));
            self.calls.lock().unwrap().push(call);
            async move { result }.boxed()
        }

        fn signals(&self) -> BoxFuture<'static, Result<BoxStream<'static, DaemonSignal>, UsbModeError>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.signal_tx.lock().unwrap() = Some(tx);
            async move { Ok(channel_stream(rx)) }.boxed()
        }
    }

    struct FakeBackend {
        presence_rx: Mutex<Option<mpsc::UnboundedReceiver<Presence>>>,
        interface: Arc<FakeInterface>,
    }

    impl Backend for FakeBackend {
        fn presence(&self) -> BoxFuture<'static, Result<BoxStream<'static, Presence>, UsbModeError>> {
            let rx = self.presence_rx.lock().unwrap().take();
            async move {
                let rx = rx.ok_or(UsbModeError::NotConnected)?;
                Ok(channel_stream(rx))
            }
            .boxed()
        }

        fn open(&self) -> BoxFuture<'static, Result<Arc<dyn RemoteInterface>, UsbModeError>> {
            let interface: Arc<dyn RemoteInterface> = Arc::new(self.interface.clone());
            async move { Ok(interface) }.boxed()
        }
    }

    /// 不读环境变量的配置
    fn test_config() -> UsbModeConfig {
        UsbModeConfig {
            bus: BusType::Session,
            service: USB_MODE_SERVICE.to_string(),
            object_path: USB_MODE_OBJECT.to_string(),
            revision: ProtocolRevision::Current,
            event_capacity: 64,
        }
    }

    fn signal_stream_closed(interface: &FakeInterface) -> bool {
        let guard = interface.signal_tx.lock().unwrap();
        guard.as_ref().expect("not subscribed").is_closed()
    }

    async fn start_client(
        interface: Arc<FakeInterface>,
    ) -> (UsbModeClient, mpsc::UnboundedSender<Presence>) {
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        let backend = FakeBackend {
            presence_rx: Mutex::new(Some(presence_rx)),
            interface,
        };
        let client = UsbModeClient::with_backend(backend, &test_config())
            .await
            .unwrap();
        (client, presence_tx)
    }

    async fn next_event(rx: &mut broadcast::Receiver<ProxyEvent>) -> ProxyEvent {
        tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_bus_type_from_str() {
        assert_eq!("system".parse::<BusType>(), Ok(BusType::System));
        assert_eq!("Session".parse::<BusType>(), Ok(BusType::Session));
        assert!("starter".parse::<BusType>().is_err());
    }

    #[test]
    fn test_config_default() {
        let config = UsbModeConfig::default();
        assert_eq!(config.object_path, "/com/meego/usb_moded");
        assert_eq!(config.event_capacity, 64);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_rejected() {
        let (_tx, presence_rx) = mpsc::unbounded_channel();
        let backend = FakeBackend {
            presence_rx: Mutex::new(Some(presence_rx)),
            interface: Arc::new(FakeInterface::with_defaults()),
        };
        let config = UsbModeConfig {
            event_capacity: 0,
            ..test_config()
        };
        let result = UsbModeClient::with_backend(backend, &config).await;
        assert!(matches!(result, Err(UsbModeError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_client_becomes_available() {
        let interface = Arc::new(FakeInterface::with_defaults());
        let (client, presence) = start_client(interface.clone()).await;
        assert!(!client.available());

        presence.send(Presence::Registered).unwrap();
        let snapshot = tokio::time::timeout(TIMEOUT, client.wait_available())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(snapshot.current_mode, mode::MTP);
        assert_eq!(snapshot.config_mode, mode::ASK);
        assert_eq!(snapshot.supported_modes, vec!["mtp_mode", "developer_mode", "charging_only"]);
        assert!(snapshot.hidden_modes.is_empty());

        let mut methods = interface.methods();
        methods.sort();
        assert_eq!(
            methods,
            vec![
                "get_available_modes_for_user",
                "get_config",
                "get_hidden",
                "get_modes",
                "get_target_state",
                "mode_request",
            ]
        );
    }

    #[tokio::test]
    async fn test_setup_completes_when_every_call_fails() {
        let interface = Arc::new(FakeInterface::default());
        let (client, presence) = start_client(interface).await;

        presence.send(Presence::Registered).unwrap();
        let snapshot = tokio::time::timeout(TIMEOUT, client.wait_available())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.current_mode, "");
    }

    #[tokio::test]
    async fn test_mutations_rejected_while_disconnected() {
        let interface = Arc::new(FakeInterface::with_defaults());
        let (client, presence) = start_client(interface.clone()).await;

        presence.send(Presence::Unregistered).unwrap();
        assert!(!client.set_current_mode(mode::DEVELOPER).await);
        assert!(!client.set_config_mode(mode::DEVELOPER).await);
        assert!(!client.hide_mode(mode::MTP).await);
        assert!(!client.unhide_mode(mode::MTP).await);
        assert!(interface.methods().is_empty());
        assert_eq!(client.snapshot(), ProxySnapshot::default());
    }

    #[tokio::test]
    async fn test_set_mode_waits_for_state_signal() {
        let interface = Arc::new(FakeInterface::with_defaults());
        // daemon 接受请求但最终落到 fallback 模式
        interface.reply("set_mode", Ok(mode::CHARGING_FALLBACK.to_string()));
        let (client, presence) = start_client(interface.clone()).await;
        let mut events = client.subscribe();

        presence.send(Presence::Registered).unwrap();
        tokio::time::timeout(TIMEOUT, client.wait_available())
            .await
            .unwrap()
            .unwrap();

        assert!(client.set_current_mode(mode::DEVELOPER).await);
        interface.emit(DaemonSignal::StateChanged(mode::CHARGING_FALLBACK.to_string()));

        loop {
            match next_event(&mut events).await {
                ProxyEvent::CurrentModeChanged(m) if m == mode::CHARGING_FALLBACK => break,
                ProxyEvent::CurrentModeChanged(m) => assert_eq!(m, mode::MTP),
                _ => {}
            }
        }
        assert_eq!(client.current_mode(), mode::CHARGING_FALLBACK);
        assert!(interface.methods().contains(&"set_mode"));
    }

    #[tokio::test]
    async fn test_hide_mode_failure_is_published() {
        let interface = Arc::new(FakeInterface::with_defaults());
        interface.reply(
            "hide_mode",
            Err(CallError::new("com.meego.usb_moded.Error", "cannot hide")),
        );
        let (client, presence) = start_client(interface).await;
        let mut events = client.subscribe();

        presence.send(Presence::Registered).unwrap();
        tokio::time::timeout(TIMEOUT, client.wait_available())
            .await
            .unwrap()
            .unwrap();

        assert!(client.hide_mode(mode::MTP).await);
        loop {
            if let ProxyEvent::HideModeFailed { mode: m, error } = next_event(&mut events).await {
                assert_eq!(m, mode::MTP);
                assert_eq!(error, "cannot hide");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_service_loss_resets_available() {
        let interface = Arc::new(FakeInterface::with_defaults());
        let (client, presence) = start_client(interface).await;
        let mut events = client.subscribe();

        presence.send(Presence::Registered).unwrap();
        tokio::time::timeout(TIMEOUT, client.wait_available())
            .await
            .unwrap()
            .unwrap();

        presence.send(Presence::Unregistered).unwrap();
        loop {
            if next_event(&mut events).await == ProxyEvent::AvailableChanged(false) {
                break;
            }
        }
        assert!(!client.available());
        // 属性保留最后已知的值
        assert_eq!(client.current_mode(), mode::MTP);
        assert!(!client.set_current_mode(mode::DEVELOPER).await);
    }

    #[tokio::test]
    async fn test_signals_update_snapshot() {
        let interface = Arc::new(FakeInterface::with_defaults());
        let (client, presence) = start_client(interface.clone()).await;
        let mut events = client.subscribe();

        presence.send(Presence::Registered).unwrap();
        tokio::time::timeout(TIMEOUT, client.wait_available())
            .await
            .unwrap()
            .unwrap();

        interface.emit(DaemonSignal::HiddenModesChanged("developer_mode, developer_mode".to_string()));
        loop {
            if let ProxyEvent::HiddenModesChanged(modes) = next_event(&mut events).await {
                assert_eq!(modes, vec!["developer_mode"]);
                break;
            }
        }
        assert_eq!(client.hidden_modes(), vec!["developer_mode"]);
    }

    #[tokio::test]
    async fn test_drop_stops_signal_forwarding() {
        let interface = Arc::new(FakeInterface::with_defaults());
        let (client, presence) = start_client(interface.clone()).await;

        presence.send(Presence::Registered).unwrap();
        tokio::time::timeout(TIMEOUT, client.wait_available())
            .await
            .unwrap()
            .unwrap();
        assert!(!signal_stream_closed(&interface));

        drop(client);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(signal_stream_closed(&interface));
    }

    #[tokio::test]
    async fn test_shutdown_stops_signal_forwarding() {
        let interface = Arc::new(FakeInterface::with_defaults());
        let (client, presence) = start_client(interface.clone()).await;

        presence.send(Presence::Registered).unwrap();
        tokio::time::timeout(TIMEOUT, client.wait_available())
            .await
            .unwrap()
            .unwrap();

        client.shutdown();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(signal_stream_closed(&interface));
        assert!(!client.set_current_mode(mode::DEVELOPER).await);
    }

    #[tokio::test]
    async fn test_event_loop_exits_when_senders_are_released() {
        let interface = Arc::new(FakeInterface::with_defaults());
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(8);
        let proxy = ModeProxy::new();
        let (snapshot_tx, mut snapshot_rx) = watch::channel(proxy.snapshot());

        let driver = Driver {
            proxy,
            backend: Box::new(FakeBackend {
                presence_rx: Mutex::new(None),
                interface: interface.clone(),
            }),
            interface: None,
            signal_task: None,
            inbound_tx: inbound_tx.downgrade(),
            event_tx,
            snapshot_tx,
        };
        let task = tokio::spawn(driver.run(channel_stream(presence_rx), inbound_rx));

        presence_tx.send(Presence::Registered).unwrap();
        tokio::time::timeout(TIMEOUT, snapshot_rx.wait_for(|s| s.available))
            .await
            .unwrap()
            .unwrap();

        // 只剩弱引用后循环退出，转发任务随之停止
        drop(inbound_tx);
        tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(signal_stream_closed(&interface));
    }
}
