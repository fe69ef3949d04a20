// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::{
    os::fd::{AsRawFd, RawFd},
    path::Path,
    sync::Arc,
    time,
};

use crossbeam_channel as crossbeam;
use tracing::{debug, error, trace, trace_span, warn};

use crate::{
    backend::{DrmBackend, Launcher},
    connector::DpmsState,
    device::{Device, DeviceFlags, DeviceId, DeviceSnapshot},
    engine::LegacyEngine,
    impl_device::{ImplDevice, InitError},
    update::{KmsFeedback, KmsUpdate, SealedUpdate},
    waking_sender::{Callback, WakingSender},
    KmsError,
};

const WAKER: mio::Token = mio::Token(0);
const RETRY_TIMER: mio::Token = mio::Token(1);

// Device tokens are offset by the device id.
const DEVICE_BASE: usize = 16;

#[derive(Debug, Clone)]
pub struct KmsConfig {
    /// How long a blocking dispatch waits for an event before giving up.
    pub dispatch_timeout: time::Duration,
    /// Whether to ask the kernel to reprobe connectors when reading them.
    pub force_probe: bool,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: time::Duration::from_secs(1),
            force_probe: true,
        }
    }
}

/// The state that may only be touched from the impl context, which is
/// entered with [Kms::run_impl_task].
pub struct ImplContext {
    devices: Vec<ImplDevice>,
    engine: LegacyEngine,
    callbacks: WakingSender<Callback>,
    config: KmsConfig,
}

impl ImplContext {
    /// Queues a function to be run on the main context, the next time
    /// callbacks are flushed.
    pub fn queue_callback(&self, f: impl FnOnce() + Send + 'static) {
        if self.callbacks.send(Box::new(f)).is_err() {
            debug!("main context is gone, dropping callback");
        }
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|dev| dev.id()).collect()
    }

    pub(crate) fn add_device(
        &mut self,
        id: DeviceId,
        path: &Path,
        backend: Box<dyn DrmBackend>,
    ) -> Result<DeviceSnapshot, InitError> {
        let mut device = ImplDevice::new(id, path, backend, self.config.force_probe)?;
        self.engine.notify_device_created(&mut device);

        let snapshot = device.snapshot();
        self.devices.push(device);
        Ok(snapshot)
    }

    pub(crate) fn remove_device(&mut self, id: DeviceId) -> Option<Box<dyn DrmBackend>> {
        let idx = self.devices.iter().position(|dev| dev.id() == id)?;
        let mut device = self.devices.remove(idx);
        self.engine
            .notify_device_removed(&mut device, &self.callbacks);

        Some(device.into_backend())
    }

    pub(crate) fn process_update(
        &mut self,
        update: &mut SealedUpdate,
        now: time::Instant,
    ) -> KmsFeedback {
        let feedback = self
            .engine
            .process_update(&mut self.devices, update, &self.callbacks, now);

        // Entity state is shared, so predicting it here makes the result
        // visible to the main context as well.
        for device in &self.devices {
            for crtc in device.crtcs() {
                crtc.predict_state(update);
            }

            for connector in device.connectors() {
                connector.predict_state(update);
            }
        }

        feedback
    }

    pub(crate) fn update_states(&mut self) -> Vec<(DeviceId, DeviceSnapshot)> {
        self.devices
            .iter_mut()
            .map(|dev| {
                dev.update_states();
                (dev.id(), dev.snapshot())
            })
            .collect()
    }

    pub(crate) fn retry_page_flips(&mut self, now: time::Instant) {
        self.engine
            .retry_page_flips(&mut self.devices, &self.callbacks, now);
    }

    pub(crate) fn discard_pending_page_flips(&mut self) {
        self.engine.discard_pending_page_flips(&self.callbacks);
    }

    pub(crate) fn dispatch_idle(&mut self) {
        self.engine.dispatch_idle(&self.callbacks);
    }

    /// Handles events from one device. A blocking dispatch waits up to the
    /// configured timeout for at least one event.
    pub(crate) fn dispatch_device(
        &mut self,
        id: DeviceId,
        blocking: bool,
    ) -> Result<usize, KmsError> {
        let timeout = blocking.then_some(self.config.dispatch_timeout);

        let Self {
            devices,
            engine,
            callbacks,
            ..
        } = self;

        let device = devices
            .iter_mut()
            .find(|dev| dev.id() == id)
            .ok_or(KmsError::UnknownDevice(id))?;

        device.dispatch(timeout, engine, callbacks)
    }

    pub(crate) fn next_retry_deadline(&self) -> Option<time::Instant> {
        self.engine.next_retry_deadline()
    }
}

/// The main-context coordinator for all KMS devices.
///
/// Device I/O happens on the impl context, which is only reachable through
/// [Kms::run_impl_task]. Results come back to the main context as queued
/// callbacks, which are run by [Kms::flush_callbacks] (and by the dispatch
/// methods).
pub struct Kms {
    poll: mio::Poll,
    events: mio::Events,
    retry_timer: mio_timerfd::TimerFd,
    callbacks: crossbeam::Receiver<Callback>,

    imp: ImplContext,
    devices: Vec<Device>,
    next_device_id: u32,

    pending_update: Option<KmsUpdate>,
    resources_changed: Vec<Box<dyn FnMut(&[Device])>>,
    launcher: Box<dyn Launcher>,
}

impl Kms {
    pub fn new(launcher: Box<dyn Launcher>, config: KmsConfig) -> Result<Self, KmsError> {
        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER)?);

        let mut retry_timer = mio_timerfd::TimerFd::new(mio_timerfd::ClockId::Monotonic)?;
        poll.registry()
            .register(&mut retry_timer, RETRY_TIMER, mio::Interest::READABLE)?;

        let (send, recv) = crossbeam::unbounded();

        Ok(Self {
            poll,
            events: mio::Events::with_capacity(64),
            retry_timer,
            callbacks: recv,
            imp: ImplContext {
                devices: Vec::new(),
                engine: LegacyEngine::default(),
                callbacks: WakingSender::new(waker, send),
                config,
            },
            devices: Vec::new(),
            next_device_id: 0,
            pending_update: None,
            resources_changed: Vec::new(),
            launcher,
        })
    }

    /// Runs a function on the impl context, and waits for it to finish.
    pub fn run_impl_task<T>(&mut self, f: impl FnOnce(&mut ImplContext) -> T) -> T {
        let res = trace_span!("impl_task").in_scope(|| f(&mut self.imp));

        // Any task can add or resolve retries.
        self.rearm_retry_timer();
        res
    }

    fn rearm_retry_timer(&mut self) {
        let res = match self.imp.next_retry_deadline() {
            Some(deadline) => {
                // A zero timeout would disarm the timer.
                let timeout = deadline
                    .saturating_duration_since(time::Instant::now())
                    .max(time::Duration::from_micros(1));
                self.retry_timer.set_timeout(&timeout)
            }
            None => self.retry_timer.disarm(),
        };

        if let Err(err) = res {
            error!(%err, "failed to arm page flip retry timer");
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|dev| dev.id() == id)
    }

    /// Opens a device through the launcher and reads its resources.
    pub fn create_device(
        &mut self,
        path: impl AsRef<Path>,
        flags: DeviceFlags,
    ) -> Result<DeviceId, KmsError> {
        let path = path.as_ref();
        let backend = self.launcher.open_restricted(path)?;

        let id = DeviceId(self.next_device_id);
        self.next_device_id += 1;

        let snapshot = match self.run_impl_task(|ctx| ctx.add_device(id, path, backend)) {
            Ok(snapshot) => snapshot,
            Err(InitError { error, backend }) => {
                self.launcher.close_restricted(backend);
                return Err(error);
            }
        };

        if let Some(fd) = snapshot.raw_fd {
            let res = self.poll.registry().register(
                &mut mio::unix::SourceFd(&fd),
                mio::Token(DEVICE_BASE + id.0 as usize),
                mio::Interest::READABLE,
            );

            if let Err(err) = res {
                if let Some(backend) = self.run_impl_task(|ctx| ctx.remove_device(id)) {
                    self.launcher.close_restricted(backend);
                }

                return Err(err.into());
            }
        }

        debug!(?path, %id, "added KMS device");
        self.devices
            .push(Device::new(id, path.to_owned(), flags, snapshot));
        Ok(id)
    }

    /// Closes a device. Any of its page flips still in flight are discarded.
    pub fn remove_device(&mut self, id: DeviceId) -> Result<(), KmsError> {
        let idx = self
            .devices
            .iter()
            .position(|dev| dev.id() == id)
            .ok_or(KmsError::UnknownDevice(id))?;

        let backend = self
            .run_impl_task(|ctx| ctx.remove_device(id))
            .ok_or(KmsError::UnknownDevice(id))?;

        if let Some(fd) = backend.raw_fd() {
            if let Err(err) = self
                .poll
                .registry()
                .deregister(&mut mio::unix::SourceFd(&fd))
            {
                debug!(%err, "failed to deregister device");
            }
        }

        let device = self.devices.remove(idx);
        debug!(path = ?device.path(), %id, "removed KMS device");
        self.launcher.close_restricted(backend);

        self.flush_callbacks();
        Ok(())
    }

    /// Registers a function to be called whenever device resources have been
    /// re-read, after a hotplug or device removal.
    pub fn on_resources_changed(&mut self, f: impl FnMut(&[Device]) + 'static) {
        self.resources_changed.push(Box::new(f));
    }

    /// Re-reads the state of every device.
    pub fn update_states_sync(&mut self) {
        let snapshots = self.run_impl_task(|ctx| ctx.update_states());
        for (id, snapshot) in snapshots {
            if let Some(device) = self.devices.iter_mut().find(|dev| dev.id() == id) {
                device.update_states(snapshot);
            }
        }
    }

    pub fn handle_hotplug(&mut self) {
        trace!("handling hotplug");
        self.resources_changed();
    }

    pub fn handle_device_removed(&mut self) {
        trace!("handling device removal");
        self.resources_changed();
    }

    fn resources_changed(&mut self) {
        self.update_states_sync();
        for listener in &mut self.resources_changed {
            listener(&self.devices);
        }
    }

    /// The update that changes are currently being staged in, if any.
    pub fn pending_update(&mut self) -> Option<&mut KmsUpdate> {
        self.pending_update.as_mut()
    }

    pub fn ensure_pending_update(&mut self) -> &mut KmsUpdate {
        self.pending_update.get_or_insert_with(KmsUpdate::new)
    }

    /// Seals and applies the pending update. The entity states are updated
    /// to reflect the result before this returns.
    pub fn post_pending_update_sync(&mut self) -> KmsFeedback {
        let update = self.pending_update.take().unwrap_or_default();
        self.post_update_sync(update)
    }

    pub fn post_update_sync(&mut self, update: KmsUpdate) -> KmsFeedback {
        let mut sealed = update.seal();
        let now = time::Instant::now();

        let feedback = self.run_impl_task(|ctx| ctx.process_update(&mut sealed, now));
        if let Some(err) = feedback.error() {
            debug!(%err, "KMS update failed");
        }

        feedback
    }

    /// Cancels all page flips waiting to be retried. Their feedback is told
    /// that they were discarded.
    pub fn discard_pending_page_flips(&mut self) {
        self.run_impl_task(|ctx| ctx.discard_pending_page_flips());
    }

    /// Stages DPMS on every connector, and turns off every CRTC if the
    /// state is anything but on, then applies the result.
    pub fn set_power_save(&mut self, state: DpmsState) -> KmsFeedback {
        let mut update = KmsUpdate::new();
        for device in &self.devices {
            for connector in device.connectors() {
                if connector.supports_dpms() {
                    connector.set_dpms_state(&mut update, state);
                }
            }

            if state != DpmsState::On {
                for crtc in device.crtcs() {
                    update.mode_set(crtc, Vec::new(), None);
                }
            }
        }

        self.post_update_sync(update)
    }

    /// Runs every queued callback, returning how many ran.
    pub fn flush_callbacks(&mut self) -> usize {
        let mut count = 0;
        while let Ok(callback) = self.callbacks.try_recv() {
            callback();
            count += 1;
        }

        if count > 0 {
            trace!(count, "flushed callbacks");
        }

        count
    }

    /// Waits for device events or retry deadlines, handles them, and runs
    /// any resulting callbacks. Returns the number of callbacks run.
    ///
    /// A failure reading one source doesn't stop the others from being
    /// handled. Callbacks are always flushed, and the first error is
    /// returned afterwards.
    pub fn dispatch(&mut self, timeout: Option<time::Duration>) -> Result<usize, KmsError> {
        trace_span!("poll").in_scope(|| self.poll.poll(&mut self.events, timeout))?;

        let tokens: Vec<mio::Token> = self.events.iter().map(|ev| ev.token()).collect();
        self.handle_tokens(&tokens)
    }

    fn handle_tokens(&mut self, tokens: &[mio::Token]) -> Result<usize, KmsError> {
        let mut first_err: Option<KmsError> = None;
        for token in tokens {
            match *token {
                // Callbacks are flushed below.
                WAKER => (),
                RETRY_TIMER => {
                    if let Err(err) = self.retry_timer.read() {
                        warn!(%err, "failed to read page flip retry timer");
                        first_err.get_or_insert(err.into());
                    }

                    let now = time::Instant::now();
                    self.run_impl_task(|ctx| ctx.retry_page_flips(now));
                }
                mio::Token(t) if t >= DEVICE_BASE => {
                    let id = DeviceId((t - DEVICE_BASE) as u32);
                    match self.run_impl_task(|ctx| ctx.dispatch_device(id, false)) {
                        Ok(_) => (),
                        // Events can still be queued for a removed device.
                        Err(KmsError::UnknownDevice(_)) => {
                            trace!(%id, "ignoring events for removed device")
                        }
                        Err(err) => {
                            warn!(%id, %err, "failed to dispatch device events");
                            first_err.get_or_insert(err);
                        }
                    }
                }
                token => trace!(?token, "ignoring unknown token"),
            }
        }

        self.run_impl_task(|ctx| ctx.dispatch_idle());
        let count = self.flush_callbacks();

        match first_err {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    /// Returns once at least one callback has run. If none are ready, blocks
    /// on the device's events, up to the configured timeout.
    pub fn dispatch_sync(&mut self, id: DeviceId) -> Result<usize, KmsError> {
        if self.device(id).is_none() {
            return Err(KmsError::UnknownDevice(id));
        }

        self.run_impl_task(|ctx| ctx.dispatch_idle());
        let count = self.flush_callbacks();
        if count > 0 {
            return Ok(count);
        }

        self.run_impl_task(|ctx| ctx.dispatch_device(id, true))?;
        Ok(self.flush_callbacks())
    }
}

impl AsRawFd for Kms {
    fn as_raw_fd(&self) -> RawFd {
        self.poll.as_raw_fd()
    }
}

impl Drop for Kms {
    fn drop(&mut self) {
        let ids = self.imp.device_ids();
        for id in ids {
            if let Some(backend) = self.imp.remove_device(id) {
                self.launcher.close_restricted(backend);
            }
        }

        self.imp.discard_pending_page_flips();
        self.flush_callbacks();
    }
}
