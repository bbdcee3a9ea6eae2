//! USB session core
//!
//! Owns the mapping from physical paths to synthetic device ids and the two
//! session tables (normal and debug interface). Every operation here blocks;
//! callers on the async runtime go through [`super::service::UsbService`].
//!
//! Locking: the registry mutex is the coarse lock shared by enumerate and
//! acquire. Session tables are only ever taken after the registry (or on
//! their own), never the other way round.

use super::error::{Result, SessionError};
use super::transport::{DeviceHandle, PhysicalDevice, Transport};
use common::usb_types::{DeviceId, EnumerateEntry, IoTarget, SessionId};
use protocol::REPORT_SIZE;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connect attempts before an acquire gives up
pub const CONNECT_ATTEMPTS: u32 = 3;

/// Pause between connect attempts
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Tunables for [`SessionCore`]
#[derive(Debug, Clone)]
pub struct CoreOptions {
    /// Let an acquire without a previous session take over an owned interface
    pub allow_stealing: bool,
    /// Ask for a hardware reset when opening a device nobody else holds
    pub reset_on_acquire: bool,
    pub listen_interval: Duration,
    pub listen_iterations: u32,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            allow_stealing: false,
            reset_on_acquire: true,
            listen_interval: Duration::from_millis(500),
            listen_iterations: 600,
        }
    }
}

type SharedHandle = Arc<Mutex<Box<dyn DeviceHandle>>>;

struct Session {
    id: SessionId,
    handle: SharedHandle,
}

#[derive(Default)]
struct Registry {
    ids: HashMap<String, DeviceId>,
    paths: HashMap<DeviceId, String>,
    next_id: u32,
    last: Vec<PhysicalDevice>,
}

impl Registry {
    fn allocate(&mut self, path: &str) -> DeviceId {
        if let Some(id) = self.ids.get(path) {
            return *id;
        }
        self.next_id += 1;
        let id = DeviceId(self.next_id);
        self.ids.insert(path.to_string(), id);
        self.paths.insert(id, path.to_string());
        id
    }

    fn retire(&mut self, path: &str) -> Option<DeviceId> {
        let id = self.ids.remove(path)?;
        self.paths.remove(&id);
        Some(id)
    }
}

/// A session bound for one read or write
///
/// Returned by [`SessionCore::get_device`]; holds the session's handle so
/// I/O can proceed without any core lock.
pub struct Bound {
    session: SessionId,
    path: String,
    debug: bool,
    handle: SharedHandle,
}

impl Bound {
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    fn handle(&self) -> MutexGuard<'_, Box<dyn DeviceHandle>> {
        lock(&self.handle)
    }
}

/// Marks a read or write in flight for as long as it lives
struct CallGuard<'a>(&'a AtomicUsize);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Synthetic ids, session arbitration and raw I/O over a [`Transport`]
pub struct SessionCore {
    transport: Box<dyn Transport>,
    options: CoreOptions,
    registry: Mutex<Registry>,
    normal: Mutex<HashMap<String, Session>>,
    debug: Mutex<HashMap<String, Session>>,
    calls: AtomicUsize,
    next_session: AtomicU64,
}

impl SessionCore {
    pub fn new(transport: Box<dyn Transport>, options: CoreOptions) -> Self {
        Self {
            transport,
            options,
            registry: Mutex::new(Registry::default()),
            normal: Mutex::new(HashMap::new()),
            debug: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn options(&self) -> &CoreOptions {
        &self.options
    }

    fn table(&self, debug: bool) -> MutexGuard<'_, HashMap<String, Session>> {
        if debug {
            lock(&self.debug)
        } else {
            lock(&self.normal)
        }
    }

    /// List devices with their synthetic ids and bound sessions
    ///
    /// Serves the previous snapshot while a read or write is in flight.
    pub fn enumerate(&self) -> Result<Vec<EnumerateEntry>> {
        let mut registry = lock(&self.registry);
        self.refresh(&mut registry)?;
        Ok(self.entries(&registry))
    }

    fn refresh(&self, registry: &mut Registry) -> Result<()> {
        if self.calls.load(Ordering::SeqCst) > 0 {
            debug!("Call in progress, serving cached enumeration");
            return Ok(());
        }

        let devices = self.transport.enumerate()?;
        let present: HashSet<&str> = devices.iter().map(|d| d.path.as_str()).collect();

        let vanished: Vec<String> = registry
            .ids
            .keys()
            .filter(|path| !present.contains(path.as_str()))
            .cloned()
            .collect();
        for path in vanished {
            if let Some(id) = registry.retire(&path) {
                info!("Device {} at {} disappeared", id, path);
            }
            self.release_vanished(&path);
        }

        for device in &devices {
            if !registry.ids.contains_key(&device.path) {
                let id = registry.allocate(&device.path);
                info!(
                    "Device {} at {}: vid={:#06x}, pid={:#06x}",
                    id, device.path, device.vendor_id, device.product_id
                );
            }
        }

        registry.last = devices;
        Ok(())
    }

    fn release_vanished(&self, path: &str) {
        for debug in [false, true] {
            let session = self.table(debug).remove(path);
            if let Some(session) = session {
                info!("Releasing session {} of vanished device", session.id);
                if let Err(e) = lock(&session.handle).close(true) {
                    warn!("Failed to close session {}: {}", session.id, e);
                }
            }
        }
    }

    fn entries(&self, registry: &Registry) -> Vec<EnumerateEntry> {
        let normal = self.table(false);
        let debug = self.table(true);

        let mut entries: Vec<EnumerateEntry> = registry
            .last
            .iter()
            .filter_map(|device| {
                let id = *registry.ids.get(&device.path)?;
                Some(EnumerateEntry {
                    id,
                    vendor_id: device.vendor_id,
                    product_id: device.product_id,
                    debug: device.debug,
                    session: normal.get(&device.path).map(|s| s.id.clone()),
                    debug_session: debug.get(&device.path).map(|s| s.id.clone()),
                })
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    fn path_of(&self, registry: &mut Registry, id: DeviceId) -> Result<String> {
        if let Some(path) = registry.paths.get(&id) {
            return Ok(path.clone());
        }
        // The caller may know about a device we have not enumerated yet
        self.refresh(registry)?;
        registry
            .paths
            .get(&id)
            .cloned()
            .ok_or(SessionError::DeviceNotFound(id))
    }

    /// Open a session on the device with synthetic id `device`
    ///
    /// `previous` is the caller's view of the current owner of that
    /// interface. A mismatch fails without touching any state.
    pub fn acquire(
        &self,
        device: &str,
        previous: Option<&SessionId>,
        debug: bool,
    ) -> Result<SessionId> {
        let id: DeviceId = device
            .parse()
            .map_err(|_| SessionError::MalformedData(format!("invalid device id {:?}", device)))?;

        let mut registry = lock(&self.registry);
        let path = self.path_of(&mut registry, id)?;
        let session = self.acquire_path(&path, previous, debug)?;
        info!("Acquired device {} ({}) as session {}", id, path, session);
        Ok(session)
    }

    /// Caller holds the registry lock
    fn acquire_path(
        &self,
        path: &str,
        previous: Option<&SessionId>,
        debug: bool,
    ) -> Result<SessionId> {
        let current = self.table(debug).get(path).map(|s| s.id.clone());

        if previous != current.as_ref() {
            if previous.is_none() && current.is_some() {
                if !self.options.allow_stealing {
                    return Err(SessionError::OtherCallInProgress);
                }
                debug!("Stealing {} from session {:?}", path, current);
            } else {
                return Err(SessionError::WrongPrevSession {
                    expected: previous.cloned(),
                    actual: current,
                });
            }
        }

        let prior = self.table(debug).remove(path);
        if let Some(prior) = prior {
            debug!("Releasing prior session {}", prior.id);
            lock(&prior.handle).close(false)?;
        }

        let reset = self.options.reset_on_acquire && !self.table(!debug).contains_key(path);
        let handle = self.connect(path, debug, reset)?;

        let counter = self.next_session.fetch_add(1, Ordering::SeqCst);
        let id = SessionId::new(counter, debug);
        self.table(debug).insert(
            path.to_string(),
            Session {
                id: id.clone(),
                handle: Arc::new(Mutex::new(handle)),
            },
        );
        Ok(id)
    }

    fn connect(&self, path: &str, debug: bool, reset: bool) -> Result<Box<dyn DeviceHandle>> {
        let mut attempt = 1;
        loop {
            match self.transport.connect(path, debug, reset) {
                Ok(handle) => return Ok(handle),
                Err(e) if attempt >= CONNECT_ATTEMPTS => {
                    return Err(SessionError::Connect {
                        path: path.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(
                        "Connect to {} failed (attempt {}/{}): {}",
                        path, attempt, CONNECT_ATTEMPTS, e
                    );
                    thread::sleep(CONNECT_RETRY_DELAY);
                    attempt += 1;
                }
            }
        }
    }

    /// Close a session; releasing an unknown session is not an error
    pub fn release(&self, session: &SessionId, debug: bool) -> Result<()> {
        let removed = {
            let mut table = self.table(debug);
            let path = table
                .iter()
                .find(|(_, s)| &s.id == session)
                .map(|(path, _)| path.clone());
            path.and_then(|path| table.remove(&path))
        };

        match removed {
            Some(removed) => {
                info!("Released session {}", removed.id);
                lock(&removed.handle).close(false)
            }
            None => {
                debug!("Release of unknown session {}", session);
                Ok(())
            }
        }
    }

    /// Bind the device's existing session, or acquire an anonymous one
    pub fn get_device(&self, id: DeviceId, debug: bool) -> Result<Bound> {
        let mut registry = lock(&self.registry);
        let path = self.path_of(&mut registry, id)?;
        self.bind_device(path, id, debug)
    }

    fn bind_device(&self, path: String, id: DeviceId, debug: bool) -> Result<Bound> {

        let existing = self
            .table(debug)
            .get(&path)
            .map(|s| (s.id.clone(), Arc::clone(&s.handle)));
        if let Some((session, handle)) = existing {
            return Ok(Bound {
                session,
                path,
                debug,
                handle,
            });
        }

        let session = self.acquire_path(&path, None, debug)?;
        debug!("Anonymous session {} for device {}", session, id);
        let handle = self
            .table(debug)
            .get(&path)
            .map(|s| Arc::clone(&s.handle))
            .ok_or_else(|| SessionError::SessionNotFound(session.clone()))?;
        Ok(Bound {
            session,
            path,
            debug,
            handle,
        })
    }

    fn bind_session(&self, session: &SessionId) -> Result<Bound> {
        for debug in [false, true] {
            let table = self.table(debug);
            if let Some((path, s)) = table.iter().find(|(_, s)| &s.id == session) {
                return Ok(Bound {
                    session: s.id.clone(),
                    path: path.clone(),
                    debug,
                    handle: Arc::clone(&s.handle),
                });
            }
        }
        Err(SessionError::SessionNotFound(session.clone()))
    }

    fn begin_call(&self, target: &IoTarget) -> Result<(Bound, CallGuard<'_>)> {
        let mut registry = lock(&self.registry);
        match target {
            IoTarget::Device { id, debug } => {
                // An unknown id may still need a fresh enumeration, which is
                // skipped once a call is in progress
                let path = self.path_of(&mut registry, *id)?;
                let guard = self.enter_call();
                Ok((self.bind_device(path, *id, *debug)?, guard))
            }
            IoTarget::Session(session) => {
                let guard = self.enter_call();
                Ok((self.bind_session(session)?, guard))
            }
        }
    }

    fn enter_call(&self) -> CallGuard<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        CallGuard(&self.calls)
    }

    pub fn write(&self, target: &IoTarget, data: &[u8]) -> Result<usize> {
        let (bound, _call) = self.begin_call(target)?;
        let result = bound.handle().write(data);
        self.finish_call(&bound, result)
    }

    /// Read one report
    pub fn read(&self, target: &IoTarget) -> Result<Vec<u8>> {
        let (bound, _call) = self.begin_call(target)?;
        let mut buf = [0u8; REPORT_SIZE];
        let result = bound.handle().read(&mut buf);
        let n = self.finish_call(&bound, result)?;
        Ok(buf[..n].to_vec())
    }

    fn finish_call<T>(&self, bound: &Bound, result: Result<T>) -> Result<T> {
        if let Err(SessionError::Disconnected) = &result {
            let mut table = self.table(bound.debug);
            if table
                .get(&bound.path)
                .is_some_and(|s| s.id == bound.session)
            {
                table.remove(&bound.path);
            }
            drop(table);

            info!("Session {} lost its device", bound.session);
            if let Err(e) = bound.handle().close(true) {
                warn!("Failed to close session {}: {}", bound.session, e);
            }
        }
        result
    }

    /// Wait for the device list to differ from `known`
    ///
    /// Re-enumerates every `listen_interval`. Returns the latest list once it
    /// changes or the iteration budget runs out, and fails with `Cancelled`
    /// as soon as `cancel` is observed.
    pub fn listen(
        &self,
        known: &[EnumerateEntry],
        cancel: &AtomicBool,
    ) -> Result<Vec<EnumerateEntry>> {
        let mut known = known.to_vec();
        known.sort_by_key(|e| e.id);

        let mut latest = known.clone();
        for iteration in 0..self.options.listen_iterations {
            if cancel.load(Ordering::SeqCst) {
                return Err(SessionError::Cancelled);
            }

            latest = self.enumerate()?;
            if latest != known {
                debug!("Device list changed after {} iterations", iteration + 1);
                return Ok(latest);
            }

            if iteration + 1 < self.options.listen_iterations {
                thread::sleep(self.options.listen_interval);
            }
        }

        Ok(latest)
    }
}
