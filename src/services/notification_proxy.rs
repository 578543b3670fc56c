//! Notification Proxy client.
//!
//! The device relays system notifications over a plist channel: observe a
//! set of names, then wait for `RelayNotification` messages. Common names
//! include `com.apple.mobile.application_installed` and the
//! `com.apple.itunes-client.sync*` family.

use log::{debug, warn};
use plist::Value;
use tokio::sync::oneshot;

use crate::{Error, ServiceStream};

use super::DeviceService;

/// Client for the notification proxy service.
#[derive(Debug)]
pub struct NotificationProxyClient {
    stream: ServiceStream,
}

impl DeviceService for NotificationProxyClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        "com.apple.mobile.notification_proxy".into()
    }

    async fn from_stream(stream: ServiceStream) -> Result<Self, Error> {
        Ok(Self::new(stream))
    }
}

impl NotificationProxyClient {
    pub fn new(stream: ServiceStream) -> Self {
        Self { stream }
    }

    async fn send_command(&mut self, command: &str, name: Option<&str>) -> Result<(), Error> {
        let mut dict = plist::Dictionary::new();
        dict.insert("Command".into(), command.into());
        if let Some(name) = name {
            dict.insert("Name".into(), name.into());
        }
        self.stream.send_plist(Value::Dictionary(dict)).await
    }

    /// Posts a notification to the device.
    pub async fn post_notification(&mut self, name: impl AsRef<str>) -> Result<(), Error> {
        self.send_command("PostNotification", Some(name.as_ref()))
            .await
    }

    /// Registers interest in a notification name.
    pub async fn observe_notification(&mut self, name: impl AsRef<str>) -> Result<(), Error> {
        self.send_command("ObserveNotification", Some(name.as_ref()))
            .await
    }

    /// Waits for the next relayed notification and returns its name.
    pub async fn receive_notification(&mut self) -> Result<String, Error> {
        loop {
            let message = self.stream.read_plist().await?;
            match message.get("Command").and_then(|c| c.as_string()) {
                Some("RelayNotification") => {
                    match message.get("Name").and_then(|n| n.as_string()) {
                        Some(name) => return Ok(name.to_string()),
                        None => {
                            return Err(Error::Unknown(
                                "relayed notification without a name".into(),
                            ))
                        }
                    }
                }
                Some("ProxyDeath") => return Err(Error::ConnectionClosed),
                other => {
                    warn!("Unexpected notification proxy message: {other:?}");
                }
            }
        }
    }

    /// Tells the proxy to shut down and waits for its death notice.
    pub async fn shutdown(mut self) -> Result<(), Error> {
        self.send_command("Shutdown", None).await?;
        let _ = self.stream.read_plist().await;
        Ok(())
    }

    /// Consumes the client and relays every incoming notification to the
    /// callback from an owned task.
    ///
    /// The loop ends when the connection closes or
    /// [`NotificationListener::stop`] is called; stopping is cooperative
    /// and joins the task.
    pub fn listen(
        self,
        callback: impl Fn(String) + Send + 'static,
    ) -> NotificationListener {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let mut client = self;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        debug!("Notification listener told to stop");
                        break;
                    }
                    received = client.receive_notification() => {
                        match received {
                            Ok(name) => callback(name),
                            Err(e) => {
                                debug!("Notification listener exiting: {e:?}");
                                break;
                            }
                        }
                    }
                }
            }
        });

        NotificationListener {
            handle,
            stop: Some(stop_tx),
        }
    }
}

/// Owned handle for a running notification listener task.
#[derive(Debug)]
pub struct NotificationListener {
    handle: tokio::task::JoinHandle<()>,
    stop: Option<oneshot::Sender<()>>,
}

impl NotificationListener {
    /// Signals the task to stop and joins it.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn relay(name: &str) -> Value {
        let mut dict = plist::Dictionary::new();
        dict.insert("Command".into(), "RelayNotification".into());
        dict.insert("Name".into(), name.into());
        Value::Dictionary(dict)
    }

    #[tokio::test]
    async fn observed_notifications_are_received() {
        let (client, server) = tokio::io::duplex(8192);
        let mut np = NotificationProxyClient::new(ServiceStream::new(Box::new(client), "np"));

        let device = tokio::spawn(async move {
            let mut stream = ServiceStream::new(Box::new(server), "fake-np");

            let observe = stream.read_plist().await.unwrap();
            assert_eq!(
                observe.get("Command").and_then(|c| c.as_string()),
                Some("ObserveNotification")
            );
            assert_eq!(
                observe.get("Name").and_then(|n| n.as_string()),
                Some("com.apple.mobile.application_installed")
            );

            stream
                .send_plist(relay("com.apple.mobile.application_installed"))
                .await
                .unwrap();
        });

        np.observe_notification("com.apple.mobile.application_installed")
            .await
            .unwrap();
        let name = np.receive_notification().await.unwrap();
        assert_eq!(name, "com.apple.mobile.application_installed");
        device.await.unwrap();
    }

    #[tokio::test]
    async fn listener_invokes_the_callback_and_stops() {
        let (client, server) = tokio::io::duplex(8192);
        let np = NotificationProxyClient::new(ServiceStream::new(Box::new(client), "np"));

        let mut device = ServiceStream::new(Box::new(server), "fake-np");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = np.listen(move |name| sink.lock().unwrap().push(name));

        device.send_plist(relay("first")).await.unwrap();
        device.send_plist(relay("second")).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if seen.lock().unwrap().len() == 2 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("callback never saw the notifications");

        listener.stop().await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn proxy_death_ends_the_stream() {
        let (client, server) = tokio::io::duplex(8192);
        let mut np = NotificationProxyClient::new(ServiceStream::new(Box::new(client), "np"));

        let mut device = ServiceStream::new(Box::new(server), "fake-np");
        let mut dict = plist::Dictionary::new();
        dict.insert("Command".into(), "ProxyDeath".into());
        device.send_plist(Value::Dictionary(dict)).await.unwrap();

        match np.receive_notification().await {
            Err(Error::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }
}
