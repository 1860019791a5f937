//! Interpreter configuration.

/// Minimum free slots guaranteed to a native function.
pub const LUA_MINSTACK: usize = 20;
/// Slots kept past `stack_last` for error handling and metamethod calls.
pub const EXTRA_STACK: usize = 5;
/// Initial stack size of every thread.
pub const BASIC_STACK_SIZE: usize = 2 * LUA_MINSTACK;
/// Emergency reserve granted once a thread overflows `max_stack`.
pub const ERROR_STACK_EXTRA: usize = 200;

/// Collector scheduling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum GcMode {
    Incremental,
    Generational,
}

/// Tunables for one interpreter instance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct VmConfig {
    /// Hard limit on a thread's stack size, in slots.
    pub max_stack: usize,
    /// Limit on nested native calls.
    pub max_ccalls: u32,
    /// Initial collector mode.
    pub gc_mode: GcMode,
    /// Percentage of memory growth that starts a new incremental cycle.
    pub gc_pause: u32,
    /// Speed of the incremental collector relative to allocation.
    pub gc_stepmul: u32,
    /// log2 of the incremental step size in bytes.
    pub gc_stepsize: u32,
    /// Minor-collection frequency in generational mode (percent).
    pub gen_minor_mul: u32,
    /// Major-collection threshold in generational mode (percent).
    pub gen_major_mul: u32,
    /// Simulated allocator ceiling in bytes.
    pub memory_limit: Option<usize>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_stack: 1_000_000,
            max_ccalls: 200,
            gc_mode: GcMode::Incremental,
            gc_pause: 200,
            gc_stepmul: 100,
            gc_stepsize: 13,
            gen_minor_mul: 20,
            gen_major_mul: 100,
            memory_limit: None,
        }
    }
}

impl VmConfig {
    pub fn with_max_stack(mut self, max_stack: usize) -> Self {
        self.max_stack = max_stack.max(BASIC_STACK_SIZE);
        self
    }

    pub fn with_max_ccalls(mut self, max_ccalls: u32) -> Self {
        self.max_ccalls = max_ccalls.max(10);
        self
    }

    pub fn with_gc_mode(mut self, mode: GcMode) -> Self {
        self.gc_mode = mode;
        self
    }

    pub fn with_incremental(mut self, pause: u32, stepmul: u32, stepsize: u32) -> Self {
        self.gc_pause = pause;
        self.gc_stepmul = stepmul;
        self.gc_stepsize = stepsize;
        self
    }

    pub fn with_generational(mut self, minor_mul: u32, major_mul: u32) -> Self {
        self.gen_minor_mul = minor_mul;
        self.gen_major_mul = major_mul;
        self
    }

    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// Stack size used while handling a stack overflow.
    #[inline]
    pub fn error_stack_size(&self) -> usize {
        self.max_stack + ERROR_STACK_EXTRA
    }
}
