use std::sync::Arc;

use bitflags::bitflags;

use super::resource::Image;

bitflags! {
    /// Pipeline synchronization scopes.
    ///
    /// An empty set means "no commands"; [`Sync::all`] means "all
    /// commands".
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Sync: u32 {
        const VERTEX_INPUT = 1 << 0;
        const VERTEX_SHADING = 1 << 1;
        const FRAGMENT_SHADING = 1 << 2;
        const COMPUTE_SHADING = 1 << 3;
        const COLOR_OUTPUT = 1 << 4;
        const DS_OUTPUT = 1 << 5;
        /// All graphics stages of a draw.
        const DRAW = 1 << 6;
        const RESOLVE = 1 << 7;
        const COPY = 1 << 8;
    }
}

bitflags! {
    /// Memory access scopes.
    ///
    /// An empty set means "no access".
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const VERTEX_BUF_READ = 1 << 0;
        const INDEX_BUF_READ = 1 << 1;
        const COLOR_READ = 1 << 2;
        const COLOR_WRITE = 1 << 3;
        const DS_READ = 1 << 4;
        const DS_WRITE = 1 << 5;
        const RESOLVE_READ = 1 << 6;
        const RESOLVE_WRITE = 1 << 7;
        const COPY_READ = 1 << 8;
        const COPY_WRITE = 1 << 9;
        const SHADER_READ = 1 << 10;
        const SHADER_WRITE = 1 << 11;
        const ANY_READ = 1 << 12;
        const ANY_WRITE = 1 << 13;
    }
}

impl Access {
    /// Returns `true` if the flags specify only read accesses.
    ///
    /// An empty set is also classified as read-only.
    pub fn is_read_only(&self) -> bool {
        !self.intersects(
            Self::COLOR_WRITE
                | Self::DS_WRITE
                | Self::RESOLVE_WRITE
                | Self::COPY_WRITE
                | Self::SHADER_WRITE
                | Self::ANY_WRITE,
        )
    }
}

/// Memory layout of image subresources.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Layout {
    Undefined = 0,
    Common,
    ColorTarget,
    DsTarget,
    DsRead,
    ResolveSrc,
    ResolveDst,
    CopySrc,
    CopyDst,
    ShaderRead,
    ShaderStore,
    Present,
}

impl Layout {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub const fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Undefined,
            1 => Self::Common,
            2 => Self::ColorTarget,
            3 => Self::DsTarget,
            4 => Self::DsRead,
            5 => Self::ResolveSrc,
            6 => Self::ResolveDst,
            7 => Self::CopySrc,
            8 => Self::CopyDst,
            9 => Self::ShaderRead,
            10 => Self::ShaderStore,
            11 => Self::Present,
            _ => return None,
        })
    }
}

/// A global execution and memory dependency.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Barrier {
    pub sync_before: Sync,
    pub sync_after: Sync,
    pub access_before: Access,
    pub access_after: Access,
}

/// A [`Barrier`] plus a layout change of an image subresource range.
#[derive(Clone, Debug)]
pub struct Transition {
    pub barrier: Barrier,
    pub layout_before: Layout,
    pub layout_after: Layout,
    pub image: Arc<dyn Image>,
    pub layer: u32,
    pub layers: u32,
    pub level: u32,
    pub levels: u32,
}

#[cfg(test)]
mod tests {
    use super::{Access, Layout};

    #[test]
    fn access_read_only() {
        assert!(Access::empty().is_read_only());
        assert!((Access::SHADER_READ | Access::COPY_READ).is_read_only());
        assert!(!(Access::SHADER_READ | Access::COPY_WRITE).is_read_only());
        assert!(!Access::ANY_WRITE.is_read_only());
    }

    #[test]
    fn layout_round_trip() {
        for layout in [
            Layout::Undefined,
            Layout::Common,
            Layout::ColorTarget,
            Layout::DsTarget,
            Layout::DsRead,
            Layout::ResolveSrc,
            Layout::ResolveDst,
            Layout::CopySrc,
            Layout::CopyDst,
            Layout::ShaderRead,
            Layout::ShaderStore,
            Layout::Present,
        ] {
            assert_eq!(Layout::from_i32(layout.as_i32()), Some(layout));
        }

        assert_eq!(Layout::from_i32(-1), None);
        assert_eq!(Layout::from_i32(12), None);
    }
}
