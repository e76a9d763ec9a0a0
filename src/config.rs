use std::time::Duration;

/// Page size is fixed at database creation and recorded in the meta
/// page; reopening with a different configured size keeps the stored
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Small,
    Default,
    Large,
}

impl PageSize {
    pub fn bytes(&self) -> usize {
        match self {
            PageSize::Small => 8 * 1024,
            PageSize::Default => 16 * 1024,
            PageSize::Large => 32 * 1024,
        }
    }

    pub fn from_bytes(bytes: usize) -> Option<PageSize> {
        match bytes {
            8192 => Some(PageSize::Small),
            16384 => Some(PageSize::Default),
            32768 => Some(PageSize::Large),
            _ => None,
        }
    }
}

/// The page file grows in whole blocks to amortize remap cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthBlock {
    Small,
    Default,
    Large,
}

impl GrowthBlock {
    pub fn bytes(&self) -> usize {
        match self {
            GrowthBlock::Small => 512 * 1024,
            GrowthBlock::Default => 1024 * 1024,
            GrowthBlock::Large => 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, Copy)]
pub struct DbConfig {
    pub page_size: PageSize,
    pub growth_block: GrowthBlock,
    pub access: AccessMode,

    /// Interval of the background checkpoint timer.
    pub auto_checkpoint_interval: Duration,

    /// WAL size that triggers a checkpoint between timer ticks.
    pub auto_checkpoint_threshold: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            page_size: PageSize::Default,
            growth_block: GrowthBlock::Default,
            access: AccessMode::ReadWrite,
            auto_checkpoint_interval: Duration::from_secs(30),
            auto_checkpoint_threshold: 10 * 1024 * 1024,
        }
    }
}
