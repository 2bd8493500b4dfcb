//! Sizes and policies read once when the pool layer starts.

use crate::error::ConfigError;
use crate::pool::{is_aligned, SpaceType, GB, MB, POOL_ALIGNMENT};

pub const DEFAULT_OBJECT_POOL_SIZE: usize = 256 * MB;
pub const DEFAULT_INTERNAL_SPACE_SIZE: usize = 64 * MB;
pub const DEFAULT_COMPILER_SPACE_SIZE: usize = 64 * MB;
pub const DEFAULT_CODE_SPACE_SIZE: usize = 32 * MB;
pub const DEFAULT_FRAMES_SPACE_SIZE: usize = 16 * MB;
pub const DEFAULT_NATIVE_STACKS_SPACE_SIZE: usize = 16 * MB;

/// Largest object space the classification index is sized for.
pub const MAX_OBJECT_POOL_SIZE: usize = 4 * GB;

pub const DEFAULT_INITIAL_HEAP_SIZE: usize = 32 * MB;
pub const DEFAULT_MAX_HEAP_SIZE: usize = DEFAULT_OBJECT_POOL_SIZE;
pub const DEFAULT_MIN_FREE_PERCENTAGE: u32 = 10;
pub const DEFAULT_MAX_FREE_PERCENTAGE: u32 = 70;
/// Young size used when neither young size is configured.
pub const DEFAULT_YOUNG_SPACE_SIZE: usize = 4 * MB;

/// Ceilings of every space managed by the pool manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemConfig {
    pub object_pool_size: usize,
    pub internal_size: usize,
    pub compiler_size: usize,
    pub code_size: usize,
    pub frames_size: usize,
    pub native_stacks_size: usize,
}

impl Default for MemConfig {
    fn default() -> Self {
        MemConfig {
            object_pool_size: DEFAULT_OBJECT_POOL_SIZE,
            internal_size: DEFAULT_INTERNAL_SPACE_SIZE,
            compiler_size: DEFAULT_COMPILER_SPACE_SIZE,
            code_size: DEFAULT_CODE_SPACE_SIZE,
            frames_size: DEFAULT_FRAMES_SPACE_SIZE,
            native_stacks_size: DEFAULT_NATIVE_STACKS_SPACE_SIZE,
        }
    }
}

impl MemConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object_pool_size(mut self, size: usize) -> Self {
        self.object_pool_size = size;
        self
    }

    /// Set the ceiling of any space. The object spaces share one ceiling.
    pub fn with_space_size(mut self, space: SpaceType, size: usize) -> Self {
        match space {
            SpaceType::Object | SpaceType::HumongousObject | SpaceType::NonMovableObject => {
                self.object_pool_size = size
            }
            SpaceType::Internal => self.internal_size = size,
            SpaceType::Compiler => self.compiler_size = size,
            SpaceType::Code => self.code_size = size,
            SpaceType::Frames => self.frames_size = size,
            SpaceType::NativeStacks => self.native_stacks_size = size,
            SpaceType::Undefined => panic!("Undefined space has no size"),
        }
        self
    }

    pub fn space_size(&self, space: SpaceType) -> usize {
        match space {
            SpaceType::Object | SpaceType::HumongousObject | SpaceType::NonMovableObject => {
                self.object_pool_size
            }
            SpaceType::Internal => self.internal_size,
            SpaceType::Compiler => self.compiler_size,
            SpaceType::Code => self.code_size,
            SpaceType::Frames => self.frames_size,
            SpaceType::NativeStacks => self.native_stacks_size,
            SpaceType::Undefined => 0,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let what = "object pool size";
        if self.object_pool_size == 0 {
            return Err(ConfigError::ZeroSize { what });
        }
        if !is_aligned(self.object_pool_size, POOL_ALIGNMENT) {
            return Err(ConfigError::Misaligned {
                what,
                size: self.object_pool_size,
                align: POOL_ALIGNMENT,
            });
        }
        if self.object_pool_size > MAX_OBJECT_POOL_SIZE {
            return Err(ConfigError::TooLarge {
                what,
                size: self.object_pool_size,
                max: MAX_OBJECT_POOL_SIZE,
            });
        }
        Ok(())
    }
}

/// Sizing policy of a heap space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    pub initial_size: usize,
    pub max_size: usize,
    /// Grow when less than this share of the space is free after a GC.
    pub min_free_percentage: u32,
    /// Shrink when more than this share of the space is free after a GC.
    pub max_free_percentage: u32,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            initial_size: DEFAULT_INITIAL_HEAP_SIZE,
            max_size: DEFAULT_MAX_HEAP_SIZE,
            min_free_percentage: DEFAULT_MIN_FREE_PERCENTAGE,
            max_free_percentage: DEFAULT_MAX_FREE_PERCENTAGE,
        }
    }
}

impl HeapConfig {
    pub fn new(initial_size: usize, max_size: usize) -> Self {
        HeapConfig {
            initial_size,
            max_size,
            ..Self::default()
        }
    }

    pub fn with_free_percentages(mut self, min: u32, max: u32) -> Self {
        self.min_free_percentage = min;
        self.max_free_percentage = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::ZeroSize { what: "max heap size" });
        }
        if self.initial_size > self.max_size {
            return Err(ConfigError::InvertedBounds {
                lower: "initial heap size",
                upper: "max heap size",
            });
        }
        for &(what, value) in &[
            ("min free percentage", self.min_free_percentage),
            ("max free percentage", self.max_free_percentage),
        ] {
            if value > 100 {
                return Err(ConfigError::BadPercentage { what, value });
            }
        }
        if self.min_free_percentage > self.max_free_percentage {
            return Err(ConfigError::InvertedBounds {
                lower: "min free percentage",
                upper: "max free percentage",
            });
        }
        Ok(())
    }
}

/// Sizing policy of a young/tenured heap. Young sizes are optional; see
/// `GenerationalSpaces::initialize` for how unset ones are derived.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenerationalConfig {
    pub heap: HeapConfig,
    pub initial_young_size: Option<usize>,
    pub max_young_size: Option<usize>,
}

impl GenerationalConfig {
    pub fn new(heap: HeapConfig) -> Self {
        GenerationalConfig {
            heap,
            initial_young_size: None,
            max_young_size: None,
        }
    }

    pub fn with_initial_young_size(mut self, size: usize) -> Self {
        self.initial_young_size = Some(size);
        self
    }

    pub fn with_max_young_size(mut self, size: usize) -> Self {
        self.max_young_size = Some(size);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.heap.validate()?;
        let young = self.initial_young_size.into_iter().chain(self.max_young_size);
        for size in young {
            if size > self.heap.max_size {
                return Err(ConfigError::TooLarge {
                    what: "young space size",
                    size,
                    max: self.heap.max_size,
                });
            }
        }
        Ok(())
    }
}
