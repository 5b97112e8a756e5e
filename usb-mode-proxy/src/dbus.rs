//! D-Bus 后端
//!
//! 通过 zbus 访问 `com.meego.usb_moded`，并用
//! `org.freedesktop.DBus.NameOwnerChanged` 观察服务是否在总线上。

use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use tracing::{debug, info};
use zbus::fdo::DBusProxy;
use zbus::names::BusName;
use zbus::proxy::CacheProperties;
use zbus::{proxy, Connection};

use crate::backend::{Backend, RemoteInterface};
use crate::client::{BusType, UsbModeConfig};
use crate::error::{CallError, UsbModeError};
use crate::events::{DaemonCall, DaemonSignal, Mutation, Presence, SetupCall};

pub const USB_MODE_SERVICE: &str = "com.meego.usb_moded";
pub const USB_MODE_OBJECT: &str = "/com/meego/usb_moded";
pub const USB_MODE_INTERFACE: &str = "com.meego.usb_moded";

/// usb_moded D-Bus 接口
#[proxy(
    interface = "com.meego.usb_moded",
    default_service = "com.meego.usb_moded",
    default_path = "/com/meego/usb_moded",
    gen_blocking = false
)]
pub trait UsbModed {
    #[zbus(name = "get_modes")]
    fn get_modes(&self) -> zbus::Result<String>;

    #[zbus(name = "get_available_modes_for_user")]
    fn get_available_modes_for_user(&self) -> zbus::Result<String>;

    #[zbus(name = "get_config")]
    fn get_config(&self) -> zbus::Result<String>;

    #[zbus(name = "get_target_state")]
    fn get_target_state(&self) -> zbus::Result<String>;

    #[zbus(name = "mode_request")]
    fn mode_request(&self) -> zbus::Result<String>;

    #[zbus(name = "get_hidden")]
    fn get_hidden(&self) -> zbus::Result<String>;

    #[zbus(name = "set_mode")]
    fn set_mode(&self, mode: &str) -> zbus::Result<String>;

    #[zbus(name = "set_config")]
    fn set_config(&self, mode: &str) -> zbus::Result<String>;

    #[zbus(name = "hide_mode")]
    fn hide_mode(&self, mode: &str) -> zbus::Result<String>;

    #[zbus(name = "unhide_mode")]
    fn unhide_mode(&self, mode: &str) -> zbus::Result<String>;

    #[zbus(signal, name = "sig_usb_state_ind")]
    fn sig_usb_state_ind(&self, mode: &str) -> zbus::Result<()>;

    #[zbus(signal, name = "sig_usb_target_state_ind")]
    fn sig_usb_target_state_ind(&self, mode: &str) -> zbus::Result<()>;

    #[zbus(signal, name = "sig_usb_event_ind")]
    fn sig_usb_event_ind(&self, event: &str) -> zbus::Result<()>;

    #[zbus(signal, name = "sig_usb_config_ind")]
    fn sig_usb_config_ind(&self, section: &str, key: &str, value: &str) -> zbus::Result<()>;

    #[zbus(signal, name = "sig_usb_supported_modes_ind")]
    fn sig_usb_supported_modes_ind(&self, modes: &str) -> zbus::Result<()>;

    #[zbus(signal, name = "sig_usb_available_modes_ind")]
    fn sig_usb_available_modes_ind(&self, modes: &str) -> zbus::Result<()>;

    #[zbus(signal, name = "sig_usb_hidden_modes_ind")]
    fn sig_usb_hidden_modes_ind(&self, modes: &str) -> zbus::Result<()>;

    #[zbus(signal, name = "sig_usb_state_error_ind")]
    fn sig_usb_state_error_ind(&self, error: &str) -> zbus::Result<()>;
}

/// 基于 zbus 的后端
#[derive(Clone)]
pub struct DbusBackend {
    connection: Connection,
    service: String,
    object_path: String,
}

impl DbusBackend {
    /// 连接配置中指定的总线
    pub async fn connect(config: &UsbModeConfig) -> Result<Self, UsbModeError> {
        let connection = match config.bus {
            BusType::System => Connection::system().await?,
            BusType::Session => Connection::session().await?,
        };
        info!(
            "[DbusBackend] Connected to {} bus, watching {}",
            config.bus.as_str(),
            config.service
        );
        Ok(Self::with_connection(connection, config))
    }

    pub fn with_connection(connection: Connection, config: &UsbModeConfig) -> Self {
        Self {
            connection,
            service: config.service.clone(),
            object_path: config.object_path.clone(),
        }
    }
}

impl Backend for DbusBackend {
    fn presence(&self) -> BoxFuture<'static, Result<BoxStream<'static, Presence>, UsbModeError>> {
        let connection = self.connection.clone();
        let service = self.service.clone();

        async move {
            let dbus = DBusProxy::new(&connection).await?;

            // 先订阅再查询，避免两者之间的变化丢失
            let changes = dbus
                .receive_name_owner_changed_with_args(&[(0, service.as_str())])
                .await?;

            let name = BusName::try_from(service.clone())
                .map_err(|e| UsbModeError::InvalidConfig(format!("{}: {}", service, e)))?;
            let initial = if dbus.name_has_owner(name).await? {
                Presence::Registered
            } else {
                Presence::Unregistered
            };
            debug!("[DbusBackend] {} initially {:?}", service, initial);

            let changes = changes.filter_map(|signal| async move {
                let args = signal.args().ok()?;
                if args.new_owner().is_some() {
                    Some(Presence::Registered)
                } else {
                    Some(Presence::Unregistered)
                }
            });

            Ok(stream::once(future::ready(initial)).chain(changes).boxed())
        }
        .boxed()
    }

    fn open(&self) -> BoxFuture<'static, Result<Arc<dyn RemoteInterface>, UsbModeError>> {
        let connection = self.connection.clone();
        let service = self.service.clone();
        let object_path = self.object_path.clone();

        async move {
            let proxy = UsbModedProxy::builder(&connection)
                .destination(service)?
                .path(object_path)?
                .cache_properties(CacheProperties::No)
                .build()
                .await?;
            Ok(Arc::new(DbusInterface { proxy }) as Arc<dyn RemoteInterface>)
        }
        .boxed()
    }
}

/// 一个 usb_moded 接口句柄
struct DbusInterface {
    proxy: UsbModedProxy<'static>,
}

impl RemoteInterface for DbusInterface {
    fn call(&self, call: DaemonCall) -> BoxFuture<'static, Result<String, CallError>> {
        let proxy = self.proxy.clone();

        async move {
            let result = match &call {
                DaemonCall::Setup(SetupCall::GetModes) => proxy.get_modes().await,
                DaemonCall::Setup(SetupCall::GetAvailableModes) => {
                    proxy.get_available_modes_for_user().await
                }
                DaemonCall::Setup(SetupCall::GetConfig) => proxy.get_config().await,
                DaemonCall::Setup(SetupCall::GetTargetState) => proxy.get_target_state().await,
                DaemonCall::Setup(SetupCall::ModeRequest) => proxy.mode_request().await,
                DaemonCall::Setup(SetupCall::GetHidden) => proxy.get_hidden().await,
                DaemonCall::Mutation(Mutation::SetMode(mode)) => proxy.set_mode(mode).await,
                DaemonCall::Mutation(Mutation::SetConfig(mode)) => proxy.set_config(mode).await,
                DaemonCall::Mutation(Mutation::HideMode(mode)) => proxy.hide_mode(mode).await,
                DaemonCall::Mutation(Mutation::UnhideMode(mode)) => proxy.unhide_mode(mode).await,
            };
            result.map_err(CallError::from)
        }
        .boxed()
    }

    fn signals(&self) -> BoxFuture<'static, Result<BoxStream<'static, DaemonSignal>, UsbModeError>> {
        let proxy = self.proxy.clone();

        async move {
            let state = proxy
                .receive_sig_usb_state_ind()
                .await?
                .filter_map(|s| async move {
                    let args = s.args().ok()?;
                    Some(DaemonSignal::StateChanged(args.mode().to_string()))
                })
                .boxed();

            let target = proxy
                .receive_sig_usb_target_state_ind()
                .await?
                .filter_map(|s| async move {
                    let args = s.args().ok()?;
                    Some(DaemonSignal::TargetStateChanged(args.mode().to_string()))
                })
                .boxed();

            let event = proxy
                .receive_sig_usb_event_ind()
                .await?
                .filter_map(|s| async move {
                    let args = s.args().ok()?;
                    Some(DaemonSignal::Event(args.event().to_string()))
                })
                .boxed();

            let config = proxy
                .receive_sig_usb_config_ind()
                .await?
                .filter_map(|s| async move {
                    let args = s.args().ok()?;
                    Some(DaemonSignal::ConfigChanged {
                        section: args.section().to_string(),
                        key: args.key().to_string(),
                        value: args.value().to_string(),
                    })
                })
                .boxed();

            let supported = proxy
                .receive_sig_usb_supported_modes_ind()
                .await?
                .filter_map(|s| async move {
                    let args = s.args().ok()?;
                    Some(DaemonSignal::SupportedModesChanged(args.modes().to_string()))
                })
                .boxed();

            let available = proxy
                .receive_sig_usb_available_modes_ind()
                .await?
                .filter_map(|s| async move {
                    let args = s.args().ok()?;
                    Some(DaemonSignal::AvailableModesChanged(args.modes().to_string()))
                })
                .boxed();

            let hidden = proxy
                .receive_sig_usb_hidden_modes_ind()
                .await?
                .filter_map(|s| async move {
                    let args = s.args().ok()?;
                    Some(DaemonSignal::HiddenModesChanged(args.modes().to_string()))
                })
                .boxed();

            let error = proxy
                .receive_sig_usb_state_error_ind()
                .await?
                .filter_map(|s| async move {
                    let args = s.args().ok()?;
                    Some(DaemonSignal::StateError(args.error().to_string()))
                })
                .boxed();

            Ok(stream::select_all([
                state, target, event, config, supported, available, hidden, error,
            ])
            .boxed())
        }
        .boxed()
    }
}
