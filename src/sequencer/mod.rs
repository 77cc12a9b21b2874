//! Precondition sequencer
//!
//! Turns a test intent into the exact granule and RTT state a command needs
//! before it is invoked. Fixtures are built only through the command surface
//! and the `host` helpers, and every realm or granule they create is owned by
//! the sequencer's scope and released when the sequencer is dropped.

pub mod fixtures;
pub mod intent;

pub use intent::{
    GranuleContext, GranuleIntent, IpaContext, IpaFixture, IpaIntent, RangeArgs, RangeContext,
    RangeIntent, RecArgs, RecContext, RecIntent,
};

use crate::error::PrepError;
use crate::host::{self, RealmHandle, RealmId, RealmScope, RealmSpec};
use crate::monitor::{MonitorConfig, Platform, RangeCheck};
use crate::realm::{ExitReason, RecEnter, RecExit};
use crate::rtt::TopPolicy;
use crate::types::{Ipa, Pa};
use tracing::{debug, trace};

/// Outcome of a fixture that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared<T> {
    Ready(T),
    /// The platform cannot express this precondition; only the affected check is skipped.
    Skip(String),
}

impl<T> Prepared<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Prepared<U> {
        match self {
            Prepared::Ready(value) => Prepared::Ready(f(value)),
            Prepared::Skip(reason) => Prepared::Skip(reason),
        }
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Prepared::Ready(value) => Some(value),
            Prepared::Skip(_) => None,
        }
    }
}

pub type PrepResult<T> = Result<Prepared<T>, PrepError>;

/// Check-ordering settings shared with the monitor so expectations agree with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSettings {
    pub range_precedence: Vec<RangeCheck>,
    pub top_policy: TopPolicy,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            range_precedence: RangeCheck::default_precedence(),
            top_policy: TopPolicy::default(),
        }
    }
}

impl From<&MonitorConfig> for CheckSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            range_precedence: config.range_precedence.clone(),
            top_policy: config.top_policy,
        }
    }
}

pub struct Sequencer<'m, M: Platform> {
    platform: &'m mut M,
    scope: RealmScope,
    checks: CheckSettings,
    next_vmid: u16,
}

impl<'m, M: Platform> Sequencer<'m, M> {
    pub fn new(platform: &'m mut M) -> Self {
        Self::with_checks(platform, CheckSettings::default())
    }

    pub fn with_checks(platform: &'m mut M, checks: CheckSettings) -> Self {
        Self {
            platform,
            scope: RealmScope::new(),
            checks,
            next_vmid: 1,
        }
    }

    pub fn platform(&mut self) -> &mut M {
        &mut *self.platform
    }

    pub fn platform_ref(&self) -> &M {
        &*self.platform
    }

    pub fn checks(&self) -> &CheckSettings {
        &self.checks
    }

    /// A delegated granule released with the scope.
    pub fn delegated(&mut self) -> Result<Pa, PrepError> {
        let pa = host::delegated_granule(self.platform)?;
        self.scope.track_granule(pa);
        Ok(pa)
    }

    /// An undelegated granule released with the scope.
    pub fn undelegated(&mut self) -> Result<Pa, PrepError> {
        let pa = host::undelegated_granule(self.platform)?;
        self.scope.track_granule(pa);
        Ok(pa)
    }

    pub fn track_granule(&mut self, pa: Pa) {
        self.scope.track_granule(pa);
    }

    /// Builds a realm with a VMID unique within this sequencer.
    pub fn realm(&mut self, mut spec: RealmSpec) -> Result<RealmId, PrepError> {
        spec.params.vmid = self.next_vmid;
        self.next_vmid = self.next_vmid.wrapping_add(1);
        let realm = host::realm_setup(self.platform, &spec)?;
        debug!(
            rd = format_args!("{:#x}", realm.rd),
            vmid = spec.params.vmid,
            recs = realm.recs.len(),
            "fixture realm ready"
        );
        Ok(self.scope.adopt(realm))
    }

    pub fn handle(&self, id: RealmId) -> Result<&RealmHandle, PrepError> {
        self.scope
            .realm(id)
            .ok_or_else(|| PrepError::step("realm lookup", format!("no realm {id} in scope")))
    }

    /// Runs `f` against the platform and the realm handle `id`.
    pub fn with_realm<R>(
        &mut self,
        id: RealmId,
        f: impl FnOnce(&mut M, &mut RealmHandle) -> Result<R, PrepError>,
    ) -> Result<R, PrepError> {
        let realm = self
            .scope
            .realm_mut(id)
            .ok_or_else(|| PrepError::step("realm lookup", format!("no realm {id} in scope")))?;
        f(&mut *self.platform, realm)
    }

    pub fn rd(&self, id: RealmId) -> Result<Pa, PrepError> {
        Ok(self.handle(id)?.rd)
    }

    pub fn rec(&self, id: RealmId, index: usize) -> Result<Pa, PrepError> {
        self.handle(id)?
            .rec(index)
            .ok_or_else(|| PrepError::step("rec lookup", format!("realm {id} has no REC {index}")))
    }

    pub fn map_data(&mut self, id: RealmId, ipa: Ipa, content: Option<&[u8]>) -> Result<Pa, PrepError> {
        self.with_realm(id, |m, realm| host::map_protected_data(m, realm, ipa, content))
    }

    pub fn create_mapping(&mut self, id: RealmId, ipa: Ipa, protected: bool, plane: usize) -> Result<Ipa, PrepError> {
        self.with_realm(id, |m, realm| host::create_mapping(m, realm, ipa, protected, plane))
    }

    /// Enters `rec` and requires the exit to have `reason`.
    pub fn enter_expecting(&mut self, rec: Pa, enter: &RecEnter, reason: ExitReason) -> Result<RecExit, PrepError> {
        let exit = host::expect_ok("rec enter", self.platform.rec_enter(rec, enter))?;
        trace!(rec = format_args!("{:#x}", rec), reason = ?exit.reason, "rec exit");
        if exit.reason != reason {
            return Err(PrepError::UnexpectedExit {
                step: "rec enter",
                detail: format!("got {:?}, wanted {:?}", exit.reason, reason),
            });
        }
        Ok(exit)
    }

    /// Tears the realm down now instead of at scope end.
    pub fn teardown(&mut self, id: RealmId) -> Result<(), PrepError> {
        match self.scope.forget(id) {
            Some(realm) => host::teardown(self.platform, realm),
            None => Ok(()),
        }
    }

    /// Releases everything built so far; returns the number of leaks.
    pub fn release(&mut self) -> usize {
        self.scope.release(self.platform)
    }
}

impl<M: Platform> Drop for Sequencer<'_, M> {
    fn drop(&mut self) {
        self.release();
    }
}
