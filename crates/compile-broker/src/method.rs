//! Method and class metadata as seen by the broker
//!
//! The metadata subsystem owns methods; the broker shares them through
//! `MethodHandle` and only touches the small compile-state record here:
//! the `queued_for_compilation` bit, per-tier not-compilable bits, and the
//! installed-code slots.

use crate::code_cache::CodeRegion;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Compilation tier (a back-end cost/quality point)
pub type Tier = u8;

/// Entry BCI meaning "method entry", not on-stack replacement
pub const INVOCATION_ENTRY_BCI: i32 = -1;

/// Tier levels must be below this; each one owns a bit in the per-method masks
pub const TIER_LIMIT: Tier = 32;

/// Mask covering every tier
const ALL_TIERS: u32 = u32::MAX;

fn tier_bit(tier: Tier) -> u32 {
    1u32.checked_shl(tier as u32).unwrap_or(0)
}

/// Shared handle to a method
pub type MethodHandle = Arc<Method>;

/// Stable method identifier
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct MethodId(u64);

static NEXT_METHOD_ID: AtomicU64 = AtomicU64::new(1);

impl MethodId {
    /// Generate a new unique MethodId
    pub fn new() -> Self {
        MethodId(NEXT_METHOD_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for MethodId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declaring class of a method
///
/// Unloading is modelled as a flag plus dropping the last strong reference;
/// holders of a `Weak<ClassHolder>` must check both.
#[derive(Debug)]
pub struct ClassHolder {
    name: String,
    initialized: AtomicBool,
    unloaded: AtomicBool,
}

impl ClassHolder {
    /// Create an initialized class
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            initialized: AtomicBool::new(true),
            unloaded: AtomicBool::new(false),
        })
    }

    /// Create a class whose static initializer has not run yet
    pub fn uninitialized(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            initialized: AtomicBool::new(false),
            unloaded: AtomicBool::new(false),
        })
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the class initializer has completed
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Mark the class as initialized
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Whether the class has been unloaded
    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    /// Unload the class
    pub fn unload(&self) {
        self.unloaded.store(true, Ordering::Release);
    }
}

/// Generated code installed for a method
#[derive(Debug)]
pub struct InstalledCode {
    compile_id: u32,
    tier: Tier,
    entry_bci: i32,
    region: CodeRegion,
    instructions_size: usize,
    entrant: AtomicBool,
}

impl InstalledCode {
    pub(crate) fn new(
        compile_id: u32,
        tier: Tier,
        entry_bci: i32,
        region: CodeRegion,
        instructions_size: usize,
    ) -> Self {
        Self {
            compile_id,
            tier,
            entry_bci,
            region,
            instructions_size,
            entrant: AtomicBool::new(true),
        }
    }

    /// Compile ID that produced this code
    pub fn compile_id(&self) -> u32 {
        self.compile_id
    }

    /// Tier the code was compiled at
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Entry BCI (`INVOCATION_ENTRY_BCI` for standard code)
    pub fn entry_bci(&self) -> i32 {
        self.entry_bci
    }

    /// Whether this is on-stack-replacement code
    pub fn is_osr(&self) -> bool {
        self.entry_bci != INVOCATION_ENTRY_BCI
    }

    /// Code cache region holding the code
    pub fn region(&self) -> &CodeRegion {
        &self.region
    }

    /// Total size in the code cache
    pub fn total_size(&self) -> usize {
        self.region.size()
    }

    /// Size of the instructions section
    pub fn instructions_size(&self) -> usize {
        self.instructions_size
    }

    /// Whether new invocations may still enter this code
    pub fn is_entrant(&self) -> bool {
        self.entrant.load(Ordering::Acquire)
    }

    /// Stop new invocations from entering; returns false if already not entrant
    pub fn make_not_entrant(&self) -> bool {
        self.entrant.swap(false, Ordering::AcqRel)
    }
}

/// A method as seen by the broker
pub struct Method {
    id: MethodId,
    name: String,
    holder: Arc<ClassHolder>,
    bytecode_size: usize,
    is_native: bool,
    is_abstract: bool,
    is_method_handle_intrinsic: bool,
    native_linkable: bool,
    native_linked: AtomicBool,
    queued_for_compilation: AtomicBool,
    not_compilable: AtomicU32,
    not_osr_compilable: AtomicU32,
    is_old: AtomicBool,
    has_breakpoints: AtomicBool,
    code: RwLock<Option<Arc<InstalledCode>>>,
    osr_codes: RwLock<Vec<Arc<InstalledCode>>>,
}

impl Method {
    /// Start building a method declared by `holder`
    pub fn builder(holder: &Arc<ClassHolder>, name: impl Into<String>) -> MethodBuilder {
        MethodBuilder {
            holder: holder.clone(),
            name: name.into(),
            bytecode_size: 32,
            is_native: false,
            native_linkable: true,
            is_abstract: false,
            is_method_handle_intrinsic: false,
        }
    }

    /// Stable identifier
    pub fn id(&self) -> MethodId {
        self.id
    }

    /// Method name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declaring class
    pub fn holder(&self) -> &Arc<ClassHolder> {
        &self.holder
    }

    /// `Class::method`
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.holder.name(), self.name)
    }

    /// Bytecode length in bytes
    pub fn bytecode_size(&self) -> usize {
        self.bytecode_size
    }

    /// Whether the method is implemented natively
    pub fn is_native(&self) -> bool {
        self.is_native
    }

    /// Whether the method has no body
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Whether this is a synthetic method-handle intrinsic
    pub fn is_method_handle_intrinsic(&self) -> bool {
        self.is_method_handle_intrinsic
    }

    /// Resolve the native entry point. Runs on the requester thread since
    /// lookup may load classes.
    pub fn link_native(&self) -> bool {
        if !self.is_native || !self.native_linkable {
            return false;
        }
        self.native_linked.store(true, Ordering::Release);
        true
    }

    /// Whether the native entry has been resolved
    pub fn is_native_linked(&self) -> bool {
        self.native_linked.load(Ordering::Acquire)
    }

    /// Whether the method was superseded by a class redefinition
    pub fn is_old(&self) -> bool {
        self.is_old.load(Ordering::Acquire)
    }

    /// Mark the method as superseded by a class redefinition
    pub fn mark_old(&self) {
        self.is_old.store(true, Ordering::Release);
    }

    /// Whether a debugger breakpoint is set in the method
    pub fn has_breakpoints(&self) -> bool {
        self.has_breakpoints.load(Ordering::Acquire)
    }

    /// Set or clear the breakpoint marker
    pub fn set_breakpoints(&self, present: bool) {
        self.has_breakpoints.store(present, Ordering::Release);
    }

    // ===== Compile state =====

    /// Whether a compile task for this method is queued or running
    pub fn is_queued_for_compilation(&self) -> bool {
        self.queued_for_compilation.load(Ordering::Acquire)
    }

    /// Claim the queued bit. Fails if another request holds it.
    pub(crate) fn try_claim_queued_for_compilation(&self) -> bool {
        self.queued_for_compilation
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_queued_for_compilation(&self) {
        self.queued_for_compilation.store(true, Ordering::Release);
    }

    pub(crate) fn clear_queued_for_compilation(&self) {
        self.queued_for_compilation.store(false, Ordering::Release);
    }

    /// Whether standard compilation is prohibited at `tier`
    pub fn is_not_compilable(&self, tier: Tier) -> bool {
        self.not_compilable.load(Ordering::Acquire) & tier_bit(tier) != 0
    }

    /// Whether OSR compilation is prohibited at `tier`
    pub fn is_not_osr_compilable(&self, tier: Tier) -> bool {
        self.not_osr_compilable.load(Ordering::Acquire) & tier_bit(tier) != 0
    }

    /// Prohibit standard compilation at `tier`
    pub fn set_not_compilable(&self, tier: Tier, reason: &str, quietly: bool) {
        if !quietly {
            tracing::info!(method = %self.full_name(), tier, reason, "made not compilable");
        }
        self.not_compilable.fetch_or(tier_bit(tier), Ordering::AcqRel);
    }

    /// Prohibit OSR compilation at `tier`
    pub fn set_not_osr_compilable(&self, tier: Tier, reason: &str, quietly: bool) {
        if !quietly {
            tracing::info!(method = %self.full_name(), tier, reason, "made not OSR compilable");
        }
        self.not_osr_compilable.fetch_or(tier_bit(tier), Ordering::AcqRel);
    }

    /// Prohibit every kind of compilation at every tier
    pub fn set_not_compilable_all(&self, reason: &str) {
        tracing::info!(method = %self.full_name(), reason, "made not compilable at any tier");
        self.not_compilable.store(ALL_TIERS, Ordering::Release);
        self.not_osr_compilable.store(ALL_TIERS, Ordering::Release);
    }

    /// Current standard (non-OSR) code, if any
    pub fn code(&self) -> Option<Arc<InstalledCode>> {
        self.code.read().clone()
    }

    /// OSR code for `entry_bci`. With `only_exact` the tier must match;
    /// otherwise the best code at `tier` or above is returned.
    pub fn osr_code(&self, entry_bci: i32, tier: Tier, only_exact: bool) -> Option<Arc<InstalledCode>> {
        let codes = self.osr_codes.read();
        codes
            .iter()
            .filter(|c| c.entry_bci() == entry_bci && c.is_entrant())
            .filter(|c| if only_exact { c.tier() == tier } else { c.tier() >= tier })
            .max_by_key(|c| c.tier())
            .cloned()
    }

    pub(crate) fn install(&self, code: Arc<InstalledCode>) {
        if code.is_osr() {
            self.osr_codes.write().push(code);
        } else {
            *self.code.write() = Some(code);
        }
    }

    /// Detach installed code for `(entry_bci, tier)` and make it not entrant
    pub(crate) fn detach_code(&self, entry_bci: i32, tier: Tier) -> Option<Arc<InstalledCode>> {
        let detached = if entry_bci == INVOCATION_ENTRY_BCI {
            let mut slot = self.code.write();
            match slot.as_ref() {
                Some(code) if code.tier() == tier => slot.take(),
                _ => None,
            }
        } else {
            let mut codes = self.osr_codes.write();
            codes
                .iter()
                .position(|c| c.entry_bci() == entry_bci && c.tier() == tier)
                .map(|pos| codes.remove(pos))
        };
        if let Some(code) = &detached {
            code.make_not_entrant();
        }
        detached
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("name", &self.full_name())
            .field("queued", &self.is_queued_for_compilation())
            .finish()
    }
}

/// Builder for `Method`
pub struct MethodBuilder {
    holder: Arc<ClassHolder>,
    name: String,
    bytecode_size: usize,
    is_native: bool,
    native_linkable: bool,
    is_abstract: bool,
    is_method_handle_intrinsic: bool,
}

impl MethodBuilder {
    /// Bytecode length in bytes
    pub fn bytecode_size(mut self, size: usize) -> Self {
        self.bytecode_size = size;
        self
    }

    /// Mark as native; `linkable` decides whether entry resolution succeeds
    pub fn native(mut self, linkable: bool) -> Self {
        self.is_native = true;
        self.native_linkable = linkable;
        self
    }

    /// Mark as abstract
    pub fn abstract_method(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Mark as a method-handle intrinsic
    pub fn method_handle_intrinsic(mut self) -> Self {
        self.is_method_handle_intrinsic = true;
        self
    }

    /// Finish building
    pub fn build(self) -> MethodHandle {
        Arc::new(Method {
            id: MethodId::new(),
            name: self.name,
            holder: self.holder,
            bytecode_size: self.bytecode_size,
            is_native: self.is_native,
            is_abstract: self.is_abstract,
            is_method_handle_intrinsic: self.is_method_handle_intrinsic,
            native_linkable: self.native_linkable,
            native_linked: AtomicBool::new(false),
            queued_for_compilation: AtomicBool::new(false),
            not_compilable: AtomicU32::new(0),
            not_osr_compilable: AtomicU32::new(0),
            is_old: AtomicBool::new(false),
            has_breakpoints: AtomicBool::new(false),
            code: RwLock::new(None),
            osr_codes: RwLock::new(Vec::new()),
        })
    }
}
