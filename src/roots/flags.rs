//! Flag sets that narrow a root pass

use bitflags::bitflags;

bitflags! {
    /// Restricts which roots a visit reports
    ///
    /// The AOT string masks select between all slots and those pointing into
    /// the young generation; when both are set, all slots are visited.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VisitGcRootFlags: u32 {
        const ACCESS_ROOT_ALL = 1 << 0;
        const ACCESS_ROOT_ONLY_NEW = 1 << 1;
        const ACCESS_ROOT_NONE = 1 << 2;

        const ACCESS_ROOT_AOT_STRINGS_MASK_ALL = 1 << 3;
        const ACCESS_ROOT_AOT_STRINGS_MASK_YOUNG = 1 << 4;

        const START_RECORDING_NEW_ROOT = 1 << 10;
        const END_RECORDING_NEW_ROOT = 1 << 11;
    }
}

impl Default for VisitGcRootFlags {
    fn default() -> Self {
        Self::ACCESS_ROOT_ALL | Self::ACCESS_ROOT_AOT_STRINGS_MASK_ALL
    }
}

impl VisitGcRootFlags {
    /// AOT string slots limited to young-generation targets
    #[inline]
    pub fn aot_strings_young_only(self) -> bool {
        self.contains(Self::ACCESS_ROOT_AOT_STRINGS_MASK_YOUNG)
            && !self.contains(Self::ACCESS_ROOT_AOT_STRINGS_MASK_ALL)
    }

    /// Bits understood by class enumeration
    #[inline]
    pub fn class_flags(self) -> Self {
        self & (Self::ACCESS_ROOT_ALL
            | Self::ACCESS_ROOT_ONLY_NEW
            | Self::ACCESS_ROOT_NONE
            | Self::START_RECORDING_NEW_ROOT
            | Self::END_RECORDING_NEW_ROOT)
    }
}

bitflags! {
    /// Which cards a card-table pass visits and how it marks them
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CardTableProcessedFlag: u32 {
        const VISIT_MARKED = 1 << 0;
        const VISIT_PROCESSED = 1 << 1;
        const SET_PROCESSED = 1 << 2;
    }
}
