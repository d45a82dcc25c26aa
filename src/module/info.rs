use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use tracing::debug;

use crate::core::{Result, RuntimeError};

/// Lifecycle of an instance, tracked on its info handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Constructors are running; the instance is not published yet.
    Loading,
    /// Published and usable.
    Live,
    /// Flagged for unload; waiting for pins and dependents to go away.
    MarkedUnloadable,
    /// Teardown in progress.
    Unloading,
    /// Torn down. The info lingers until the last handle drops.
    Dead,
}

impl InstanceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Loading,
            1 => Self::Live,
            2 => Self::MarkedUnloadable,
            3 => Self::Unloading,
            _ => Self::Dead,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Loading => 0,
            Self::Live => 1,
            Self::MarkedUnloadable => 2,
            Self::Unloading => 3,
            Self::Dead => 4,
        }
    }
}

/// Shareable descriptor of a loaded (or loading, or torn down) instance.
///
/// The handle count is the `Arc` strong count: cloning the handle acquires,
/// dropping it releases, and the metadata is freed with the last clone.
/// `strong_refs` is the separate pin count that keeps the instance itself
/// from being unloaded.
pub struct InstanceInfo {
    name: String,
    description: Option<String>,
    author: Option<String>,
    license: Option<String>,
    module_path: Option<PathBuf>,
    state: AtomicU8,
    strong_refs: AtomicUsize,
    unloadable: AtomicBool,
}

pub type InfoHandle = Arc<InstanceInfo>;

impl InstanceInfo {
    pub(crate) fn new(
        name: impl Into<String>,
        description: Option<String>,
        author: Option<String>,
        license: Option<String>,
        module_path: Option<PathBuf>,
    ) -> InfoHandle {
        Arc::new(Self {
            name: name.into(),
            description,
            author,
            license,
            module_path,
            state: AtomicU8::new(InstanceState::Loading.as_u8()),
            strong_refs: AtomicUsize::new(0),
            unloadable: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn license(&self) -> Option<&str> {
        self.license.as_deref()
    }

    pub fn module_path(&self) -> Option<&Path> {
        self.module_path.as_deref()
    }

    pub fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the owning instance is still loaded.
    pub fn is_loaded(&self) -> bool {
        matches!(
            self.state(),
            InstanceState::Live | InstanceState::MarkedUnloadable
        )
    }

    pub fn strong_refs(&self) -> usize {
        self.strong_refs.load(Ordering::Acquire)
    }

    pub fn is_marked_unloadable(&self) -> bool {
        self.unloadable.load(Ordering::Acquire)
    }

    /// Signals that the instance may be unloaded.
    ///
    /// The flag is monotonic: repeated calls have no further effect. The
    /// instance is actually torn down by a later prune pass, once no pins
    /// and no inbound dependencies remain.
    pub fn mark_unloadable(&self) {
        let was_marked = self.unloadable.swap(true, Ordering::AcqRel);
        let _ = self.state.compare_exchange(
            InstanceState::Live.as_u8(),
            InstanceState::MarkedUnloadable.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if !was_marked {
            debug!(instance = %self.name, "instance marked unloadable");
        }
    }

    /// Tries to pin the instance against unload.
    ///
    /// Succeeds only while the instance is loading or live and has not been
    /// marked unloadable. The pin is released when the returned guard drops.
    pub fn try_acquire_strong(self: &Arc<Self>) -> Result<StrongRef> {
        self.strong_refs.fetch_add(1, Ordering::Acquire);
        let valid = !self.unloadable.load(Ordering::Acquire)
            && matches!(self.state(), InstanceState::Loading | InstanceState::Live);
        if !valid {
            self.strong_refs.fetch_sub(1, Ordering::Release);
            return Err(RuntimeError::InvalidState(format!(
                "instance '{}' cannot be pinned in state {:?}",
                self.name,
                self.state()
            )));
        }
        Ok(StrongRef {
            info: Arc::clone(self),
        })
    }

    pub(crate) fn acquire_strong_raw(&self) {
        self.strong_refs.fetch_add(1, Ordering::Acquire);
    }

    pub(crate) fn release_strong_raw(&self) {
        let previous = self.strong_refs.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0, "strong ref underflow on '{}'", self.name);
        if previous == 1 && self.state() == InstanceState::MarkedUnloadable {
            debug!(instance = %self.name, "instance eligible for prune");
        }
    }

    pub(crate) fn set_state(&self, state: InstanceState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Moves from one of `from` into `to`; fails when the current state is
    /// not in `from`.
    pub(crate) fn transition(&self, from: &[InstanceState], to: InstanceState) -> Result<()> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !from.iter().any(|s| s.as_u8() == current) {
                return Err(RuntimeError::InvalidState(format!(
                    "instance '{}' is {:?}",
                    self.name,
                    InstanceState::from_u8(current)
                )));
            }
            match self.state.compare_exchange(
                current,
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for InstanceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceInfo")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("strong_refs", &self.strong_refs())
            .field("unloadable", &self.is_marked_unloadable())
            .finish()
    }
}

/// RAII pin on an instance, acquired through
/// [`InstanceInfo::try_acquire_strong`]. Useful for passing data such as
/// callbacks between instances without registering a dependency edge.
pub struct StrongRef {
    info: InfoHandle,
}

impl StrongRef {
    pub fn info(&self) -> &InfoHandle {
        &self.info
    }
}

impl Clone for StrongRef {
    fn clone(&self) -> Self {
        self.info.acquire_strong_raw();
        Self {
            info: Arc::clone(&self.info),
        }
    }
}

impl Drop for StrongRef {
    fn drop(&mut self) {
        self.info.release_strong_raw();
    }
}

impl fmt::Debug for StrongRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StrongRef").field(&self.info.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_info(name: &str) -> InfoHandle {
        let info = InstanceInfo::new(name, None, None, None, None);
        info.set_state(InstanceState::Live);
        info
    }

    #[test]
    fn strong_pin_tracks_count() {
        let info = live_info("a");
        let pin = info.try_acquire_strong().unwrap();
        assert_eq!(info.strong_refs(), 1);
        let second = pin.clone();
        assert_eq!(info.strong_refs(), 2);
        drop(pin);
        drop(second);
        assert_eq!(info.strong_refs(), 0);
    }

    #[test]
    fn pin_fails_once_marked() {
        let info = live_info("a");
        info.mark_unloadable();
        assert_eq!(info.state(), InstanceState::MarkedUnloadable);
        assert!(info.try_acquire_strong().is_err());
        assert_eq!(info.strong_refs(), 0);
    }

    #[test]
    fn mark_unloadable_is_monotonic() {
        let info = live_info("a");
        info.mark_unloadable();
        info.mark_unloadable();
        assert_eq!(info.state(), InstanceState::MarkedUnloadable);
        assert!(info.is_marked_unloadable());
    }

    #[test]
    fn transition_rejects_unexpected_state() {
        let info = live_info("a");
        assert!(
            info.transition(&[InstanceState::Loading], InstanceState::Live)
                .is_err()
        );
        assert!(
            info.transition(
                &[InstanceState::Live, InstanceState::MarkedUnloadable],
                InstanceState::Unloading
            )
            .is_ok()
        );
        assert_eq!(info.state(), InstanceState::Unloading);
    }

    #[test]
    fn is_loaded_reflects_lifecycle() {
        let info = InstanceInfo::new("a", None, None, None, None);
        assert!(!info.is_loaded());
        info.set_state(InstanceState::Live);
        assert!(info.is_loaded());
        info.set_state(InstanceState::Dead);
        assert!(!info.is_loaded());
    }
}
