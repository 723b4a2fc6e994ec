use std::fmt;

/// Format of image texels.
///
/// Formats are opaque constants rather than enum variants so that a
/// backend can mint formats of its own (e.g. swapchain-private ones);
/// such formats have the internal bit set and an unknown texel size.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PixelFormat(u32);

impl PixelFormat {
    pub const UNDEFINED: Self = Self(0);

    pub const R8_UNORM: Self = Self(1);
    pub const RG8_UNORM: Self = Self(2);
    pub const RGBA8_UNORM: Self = Self(3);
    pub const RGBA8_SRGB: Self = Self(4);
    pub const BGRA8_UNORM: Self = Self(5);
    pub const BGRA8_SRGB: Self = Self(6);
    pub const RGBA16_FLOAT: Self = Self(7);
    pub const RGBA32_FLOAT: Self = Self(8);

    pub const D16_UNORM: Self = Self(9);
    pub const D32_FLOAT: Self = Self(10);
    pub const D24_UNORM_S8_UINT: Self = Self(11);
    pub const S8_UINT: Self = Self(12);

    const INTERNAL: u32 = 1 << 31;

    /// Creates a backend-private format.
    pub const fn internal(raw: u32) -> Self {
        Self(raw | Self::INTERNAL)
    }

    pub const fn is_internal(self) -> bool {
        self.0 & Self::INTERNAL != 0
    }

    /// The size of one texel in bytes, or 0 for internal formats.
    pub const fn size(self) -> u32 {
        match self.0 {
            1 => 1,
            2 => 2,
            3..=6 => 4,
            7 => 8,
            8 => 16,
            9 => 2,
            10 | 11 => 4,
            12 => 1,
            _ => 0,
        }
    }

    pub const fn is_srgb(self) -> bool {
        matches!(self.0, 4 | 6)
    }

    pub const fn has_depth(self) -> bool {
        matches!(self.0, 9..=11)
    }

    pub const fn has_stencil(self) -> bool {
        matches!(self.0, 11 | 12)
    }

    /// Whether the format carries both a depth and a stencil aspect.
    pub const fn is_combined(self) -> bool {
        self.has_depth() && self.has_stencil()
    }
}

impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            0 => "Undefined",
            1 => "R8Unorm",
            2 => "Rg8Unorm",
            3 => "Rgba8Unorm",
            4 => "Rgba8Srgb",
            5 => "Bgra8Unorm",
            6 => "Bgra8Srgb",
            7 => "Rgba16Float",
            8 => "Rgba32Float",
            9 => "D16Unorm",
            10 => "D32Float",
            11 => "D24UnormS8Uint",
            12 => "S8Uint",
            _ => return write!(f, "Internal({:#x})", self.0 & !Self::INTERNAL),
        };
        f.write_str(name)
    }
}

/// Format of a vertex attribute as it appears in a source buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Sint8,
    Sint8x2,
    Sint8x3,
    Sint8x4,
    Uint8,
    Uint8x2,
    Uint8x3,
    Uint8x4,
    Sint16,
    Sint16x2,
    Sint16x3,
    Sint16x4,
    Uint16,
    Uint16x2,
    Uint16x3,
    Uint16x4,
    Sint32,
    Sint32x2,
    Sint32x3,
    Sint32x4,
    Uint32,
    Uint32x2,
    Uint32x3,
    Uint32x4,
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
}

impl VertexFormat {
    /// The number of components in the tuple.
    pub const fn components(&self) -> u32 {
        match self {
            Self::Sint8 | Self::Uint8 | Self::Sint16 | Self::Uint16 | Self::Sint32
            | Self::Uint32 | Self::Float32 => 1,
            Self::Sint8x2 | Self::Uint8x2 | Self::Sint16x2 | Self::Uint16x2 | Self::Sint32x2
            | Self::Uint32x2 | Self::Float32x2 => 2,
            Self::Sint8x3 | Self::Uint8x3 | Self::Sint16x3 | Self::Uint16x3 | Self::Sint32x3
            | Self::Uint32x3 | Self::Float32x3 => 3,
            Self::Sint8x4 | Self::Uint8x4 | Self::Sint16x4 | Self::Uint16x4 | Self::Sint32x4
            | Self::Uint32x4 | Self::Float32x4 => 4,
        }
    }

    /// The size of one component in bytes.
    pub const fn component_size(&self) -> u32 {
        match self {
            Self::Sint8 | Self::Sint8x2 | Self::Sint8x3 | Self::Sint8x4 | Self::Uint8
            | Self::Uint8x2 | Self::Uint8x3 | Self::Uint8x4 => 1,
            Self::Sint16 | Self::Sint16x2 | Self::Sint16x3 | Self::Sint16x4 | Self::Uint16
            | Self::Uint16x2 | Self::Uint16x3 | Self::Uint16x4 => 2,
            Self::Sint32 | Self::Sint32x2 | Self::Sint32x3 | Self::Sint32x4 | Self::Uint32
            | Self::Uint32x2 | Self::Uint32x3 | Self::Uint32x4 | Self::Float32
            | Self::Float32x2 | Self::Float32x3 | Self::Float32x4 => 4,
        }
    }

    /// The size of the whole tuple in bytes.
    pub const fn size(&self) -> u32 {
        self.components() * self.component_size()
    }
}

/// Format of index buffer entries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    /// Returns the number of bytes needed to represent an index.
    pub const fn size(&self) -> u32 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}
