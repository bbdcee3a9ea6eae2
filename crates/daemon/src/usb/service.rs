//! `usb` topic facade
//!
//! Answers bus requests by calling into the [`SessionCore`]. Each request runs
//! on its own task so a long listen or a blocked read never holds up the
//! others; the core itself runs on Tokio's blocking pool.

use super::error::{Result, SessionError};
use super::session::SessionCore;
use common::usb_types::UsbPayload;
use common::{Bus, Message, MessageId, Payload, Topic};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct UsbService {
    bus: Bus,
    core: Arc<SessionCore>,
    /// Cancel flags of running listens, keyed by the listen request id
    listens: Mutex<HashMap<MessageId, Arc<AtomicBool>>>,
}

impl UsbService {
    /// Subscribe to the `usb` topic and serve it until the bus shuts down
    pub fn spawn(bus: &Bus, core: Arc<SessionCore>) -> JoinHandle<()> {
        let subscription = bus.subscribe(&[Topic::Usb]);
        let service = Arc::new(Self {
            bus: bus.clone(),
            core,
            listens: Mutex::new(HashMap::new()),
        });

        tokio::spawn(async move {
            info!("USB service started");
            while let Ok(message) = subscription.recv().await {
                if message.is_response() {
                    continue;
                }
                // Registered here so a cancel received right after the listen
                // always finds its flag
                let cancel = service.register_listen(&message);
                let service = Arc::clone(&service);
                tokio::spawn(async move { service.handle(message, cancel).await });
            }

            for cancel in service.listens().values() {
                cancel.store(true, Ordering::SeqCst);
            }
            info!("USB service stopped");
        })
    }

    fn listens(&self) -> MutexGuard<'_, HashMap<MessageId, Arc<AtomicBool>>> {
        self.listens.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register_listen(&self, message: &Message) -> Option<Arc<AtomicBool>> {
        if !matches!(message.payload, Payload::Usb(UsbPayload::Listen { .. })) {
            return None;
        }
        let cancel = Arc::new(AtomicBool::new(false));
        self.listens().insert(message.id, Arc::clone(&cancel));
        Some(cancel)
    }

    async fn handle(&self, message: Message, cancel: Option<Arc<AtomicBool>>) {
        debug!(id = %message.id, kind = %message.kind, "USB request");

        let (payload, error) = match self.dispatch(&message, cancel).await {
            Ok(payload) => (payload, None),
            Err(e) => {
                debug!(id = %message.id, kind = %message.kind, "USB request failed: {}", e);
                (Payload::Empty, Some(e.to_string()))
            }
        };

        if let Err(e) = self.bus.respond(&message, payload, error) {
            warn!("Dropping USB response to {}: {}", message.id, e);
        }
    }

    async fn dispatch(
        &self,
        message: &Message,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<Payload> {
        let Payload::Usb(request) = &message.payload else {
            return Err(SessionError::MalformedData(format!(
                "{} expects a usb payload",
                message.kind
            )));
        };

        let reply = match request.clone() {
            UsbPayload::Enumerate => {
                UsbPayload::Entries(self.blocking(|core| core.enumerate()).await?)
            }
            UsbPayload::Listen { known } => {
                let cancel = cancel.unwrap_or_default();
                let result = self
                    .blocking(move |core| core.listen(&known, &cancel))
                    .await;
                self.listens().remove(&message.id);
                UsbPayload::Entries(result?)
            }
            UsbPayload::CancelListen { request } => {
                match self.listens().get(&request) {
                    Some(cancel) => cancel.store(true, Ordering::SeqCst),
                    None => debug!("No running listen {}", request),
                }
                return Ok(Payload::Empty);
            }
            UsbPayload::Acquire {
                device,
                previous,
                debug,
            } => UsbPayload::Session(
                self.blocking(move |core| core.acquire(&device, previous.as_ref(), debug))
                    .await?,
            ),
            UsbPayload::Release { session, debug } => {
                self.blocking(move |core| core.release(&session, debug))
                    .await?;
                return Ok(Payload::Empty);
            }
            UsbPayload::Write { target, data } => UsbPayload::Written(
                self.blocking(move |core| core.write(&target, &data))
                    .await?,
            ),
            UsbPayload::Read { target } => {
                UsbPayload::Data(self.blocking(move |core| core.read(&target)).await?)
            }
            UsbPayload::Entries(_)
            | UsbPayload::Session(_)
            | UsbPayload::Written(_)
            | UsbPayload::Data(_) => {
                return Err(SessionError::MalformedData(format!(
                    "{} carries a reply payload",
                    message.kind
                )));
            }
        };

        Ok(Payload::Usb(reply))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SessionCore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let core = Arc::clone(&self.core);
        tokio::task::spawn_blocking(move || f(&core))
            .await
            .map_err(|e| SessionError::Transport(format!("USB task failed: {}", e)))?
    }
}
