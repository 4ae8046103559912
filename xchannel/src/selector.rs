//! Readiness selection over channels.
//!
//! A [`Selector`] polls the readiness of every registered channel. While
//! nothing is ready it waits on a condvar, waking up either on
//! [`Selector::wakeup`] or after the configured poll interval, and then
//! queries readiness again. The selected set is rebuilt on every cycle.
//!
//! ```text
//!   select ──> collect ready keys ──> any ready / woken? ──yes──> return n
//!                   ^                        │ no
//!                   │                        v
//!                   └──── wait (wakeup | poll interval | deadline)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::ops::Ops;
use crate::provider::Provider;

/// Registration of one channel with one selector.
pub struct SelectionKey {
    id: u64,
    channel: Weak<Channel>,
    valid_ops: Ops,
    interest: AtomicU8,
    ready: AtomicU8,
    valid: AtomicBool,
}

impl SelectionKey {
    /// Selector-assigned key id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The registered channel, unless it has been dropped.
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.upgrade()
    }

    /// False once cancelled or purged.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Cancels the registration. The key is removed on the next select.
    pub fn cancel(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            log::trace!("key {} cancelled", self.id);
        }
    }

    /// Operations this key waits for.
    pub fn interest_ops(&self) -> Ops {
        Ops::from_bits_truncate(self.interest.load(Ordering::Acquire))
    }

    /// Replaces the interest set.
    ///
    /// Fails with [`Error::InvalidInterest`] unless `ops` is a subset of
    /// the channel's valid operations.
    pub fn set_interest_ops(&self, ops: Ops) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::CancelledKey);
        }
        self.check_interest(ops)?;
        self.interest.store(ops.bits(), Ordering::Release);
        Ok(())
    }

    /// Operations found ready by the last select. Empty once cancelled.
    pub fn ready_ops(&self) -> Ops {
        if !self.is_valid() {
            return Ops::NONE;
        }
        Ops::from_bits_truncate(self.ready.load(Ordering::Acquire))
    }

    /// `READ` was ready.
    pub fn is_readable(&self) -> bool {
        self.ready_ops().contains(Ops::READ)
    }

    /// `WRITE` was ready.
    pub fn is_writable(&self) -> bool {
        self.ready_ops().contains(Ops::WRITE)
    }

    /// `CONNECT` was ready.
    pub fn is_connectable(&self) -> bool {
        self.ready_ops().contains(Ops::CONNECT)
    }

    /// `ACCEPT` was ready.
    pub fn is_acceptable(&self) -> bool {
        self.ready_ops().contains(Ops::ACCEPT)
    }

    fn check_interest(&self, ops: Ops) -> Result<()> {
        if ops.is_subset_of(self.valid_ops) {
            Ok(())
        } else {
            Err(Error::InvalidInterest {
                requested: ops,
                valid: self.valid_ops,
            })
        }
    }

    fn belongs_to(&self, channel: &Arc<Channel>) -> bool {
        std::ptr::eq(self.channel.as_ptr(), Arc::as_ptr(channel))
    }
}

impl fmt::Debug for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionKey")
            .field("id", &self.id)
            .field("interest", &self.interest_ops())
            .field("ready", &self.ready_ops())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    keys: Vec<Arc<SelectionKey>>,
    selected: Vec<Arc<SelectionKey>>,
}

#[derive(Clone, Copy)]
enum Wait {
    Now,
    Until(Instant),
    Forever,
}

/// Multiplexes readiness of channels of one flavor.
pub struct Selector {
    provider: Provider,
    poll_interval: Duration,
    registry: Mutex<Registry>,
    /// Pending wakeup, consumed by the select that observes it.
    woken: Mutex<bool>,
    wake_signal: Condvar,
    open: AtomicBool,
    next_key: AtomicU64,
}

impl Selector {
    pub(crate) fn new(provider: Provider) -> Self {
        let poll_interval = provider.config().select_poll_interval;
        Self {
            provider,
            poll_interval,
            registry: Mutex::new(Registry::default()),
            woken: Mutex::new(false),
            wake_signal: Condvar::new(),
            open: AtomicBool::new(true),
            next_key: AtomicU64::new(1),
        }
    }

    /// Provider that opened this selector.
    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// False once `close` has run.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Registers `channel` with the given interest set.
    ///
    /// Registering an already registered channel replaces the interest of
    /// its existing key and returns that key.
    pub fn register(&self, channel: &Arc<Channel>, interest: Ops) -> Result<Arc<SelectionKey>> {
        self.ensure_open()?;
        let selector_flavor = self.provider.flavor();
        if channel.flavor() != selector_flavor {
            return Err(Error::FlavorMismatch {
                channel: channel.flavor(),
                selector: selector_flavor,
            });
        }
        if !channel.is_open() {
            return Err(Error::ChannelClosed);
        }

        let mut reg = self.registry.lock();
        if let Some(key) = reg
            .keys
            .iter()
            .find(|key| key.is_valid() && key.belongs_to(channel))
        {
            key.set_interest_ops(interest)?;
            return Ok(key.clone());
        }

        let key = SelectionKey {
            id: self.next_key.fetch_add(1, Ordering::Relaxed),
            channel: Arc::downgrade(channel),
            valid_ops: channel.valid_ops(),
            interest: AtomicU8::new(0),
            ready: AtomicU8::new(0),
            valid: AtomicBool::new(true),
        };
        key.check_interest(interest)?;
        key.interest.store(interest.bits(), Ordering::Release);

        let key = Arc::new(key);
        reg.keys.push(key.clone());
        log::debug!(
            "channel {} registered as key {} with interest {:?}",
            channel.id(),
            key.id,
            interest
        );
        Ok(key)
    }

    /// Waits until at least one channel is ready or [`wakeup`](Self::wakeup)
    /// is called. Returns the number of selected keys.
    pub fn select(&self) -> Result<usize> {
        self.select_until(Wait::Forever)
    }

    /// Like [`select`](Self::select) but gives up after `timeout`. A zero
    /// timeout waits without limit.
    pub fn select_timeout(&self, timeout: Duration) -> Result<usize> {
        if timeout.is_zero() {
            self.select_until(Wait::Forever)
        } else {
            self.select_until(Wait::Until(Instant::now() + timeout))
        }
    }

    /// Selects without waiting.
    pub fn select_now(&self) -> Result<usize> {
        self.select_until(Wait::Now)
    }

    /// Makes the current select return, or the next one if none is running.
    pub fn wakeup(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.wake_signal.notify_all();
        log::trace!("selector woken up");
    }

    /// Snapshot of the registered keys.
    pub fn keys(&self) -> Vec<Arc<SelectionKey>> {
        let reg = self.registry.lock();
        reg.keys.iter().filter(|k| k.is_valid()).cloned().collect()
    }

    /// Snapshot of the keys selected by the last select.
    pub fn selected_keys(&self) -> Vec<Arc<SelectionKey>> {
        let reg = self.registry.lock();
        reg.selected.iter().filter(|k| k.is_valid()).cloned().collect()
    }

    /// Closes the selector, cancelling every key and waking any waiter.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut reg = self.registry.lock();
            for key in reg.keys.drain(..) {
                key.cancel();
            }
            reg.selected.clear();
        }
        self.wakeup();
        log::debug!("selector closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::SelectorClosed)
        }
    }

    fn select_until(&self, wait: Wait) -> Result<usize> {
        self.ensure_open()?;
        loop {
            let ready = self.collect_ready();

            let mut woken = self.woken.lock();
            if ready > 0 || *woken || !self.is_open() {
                *woken = false;
                return Ok(ready);
            }

            let now = Instant::now();
            let mut until = now + self.poll_interval;
            match wait {
                Wait::Now => return Ok(0),
                Wait::Until(deadline) => {
                    if now >= deadline {
                        return Ok(0);
                    }
                    until = until.min(deadline);
                }
                Wait::Forever => {}
            }
            self.wake_signal.wait_until(&mut woken, until);
        }
    }

    /// Purges dead keys, re-queries readiness and rebuilds the selected set.
    fn collect_ready(&self) -> usize {
        let mut reg = self.registry.lock();
        let Registry { keys, selected } = &mut *reg;
        selected.clear();

        keys.retain(|key| {
            if !key.is_valid() {
                return false;
            }
            match key.channel.upgrade() {
                Some(channel) if channel.is_open() => true,
                _ => {
                    key.cancel();
                    log::trace!("key {} dropped, channel gone", key.id);
                    false
                }
            }
        });

        for key in keys.iter() {
            let Some(channel) = key.channel.upgrade() else {
                continue;
            };
            let ready = channel.ready_ops() & key.interest_ops();
            // Cancelled since the purge above.
            if !key.is_valid() {
                key.ready.store(0, Ordering::Release);
                continue;
            }
            key.ready.store(ready.bits(), Ordering::Release);
            if !ready.is_empty() {
                selected.push(key.clone());
            }
        }
        selected.len()
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("flavor", &self.provider.flavor())
            .field("open", &self.is_open())
            .field("keys", &self.registry.lock().keys.len())
            .finish()
    }
}
