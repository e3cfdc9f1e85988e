//! Pixel format mapping between the compositor (DRM fourcc / wl_shm codes)
//! and the video formats advertised on the stream.

use drm_fourcc::DrmFourcc;

/// Raw video formats the stream can advertise.
///
/// Names follow the stream's byte-order convention, which is the reverse of
/// the little-endian DRM fourcc naming (DRM `ARGB8888` is `Bgra` here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Bgra,
    Bgrx,
    Abgr,
    Xbgr,
    Rgba,
    Rgbx,
    Argb,
    Xrgb,
    Nv12,
    Xrgb210Le,
    Xbgr210Le,
    Rgbx102Le,
    Bgrx102Le,
    Argb210Le,
    Abgr210Le,
    Rgba102Le,
    Bgra102Le,
    Rgb,
    Bgr,
}

impl PixelFormat {
    /// Stream format for a compositor DRM fourcc.
    pub fn from_drm(fourcc: DrmFourcc) -> Option<Self> {
        let format = match fourcc {
            DrmFourcc::Argb8888 => Self::Bgra,
            DrmFourcc::Xrgb8888 => Self::Bgrx,
            DrmFourcc::Rgba8888 => Self::Abgr,
            DrmFourcc::Rgbx8888 => Self::Xbgr,
            DrmFourcc::Abgr8888 => Self::Rgba,
            DrmFourcc::Xbgr8888 => Self::Rgbx,
            DrmFourcc::Bgra8888 => Self::Argb,
            DrmFourcc::Bgrx8888 => Self::Xrgb,
            DrmFourcc::Nv12 => Self::Nv12,
            DrmFourcc::Xrgb2101010 => Self::Xrgb210Le,
            DrmFourcc::Xbgr2101010 => Self::Xbgr210Le,
            DrmFourcc::Rgbx1010102 => Self::Rgbx102Le,
            DrmFourcc::Bgrx1010102 => Self::Bgrx102Le,
            DrmFourcc::Argb2101010 => Self::Argb210Le,
            DrmFourcc::Abgr2101010 => Self::Abgr210Le,
            DrmFourcc::Rgba1010102 => Self::Rgba102Le,
            DrmFourcc::Bgra1010102 => Self::Bgra102Le,
            DrmFourcc::Bgr888 => Self::Rgb,
            DrmFourcc::Rgb888 => Self::Bgr,
            _ => return None,
        };
        Some(format)
    }

    /// Stream format for a raw fourcc code, if the code is known.
    pub fn from_drm_code(code: u32) -> Option<Self> {
        DrmFourcc::try_from(code).ok().and_then(Self::from_drm)
    }

    /// The same layout with the alpha channel treated as padding.
    pub fn strip_alpha(&self) -> Option<Self> {
        match self {
            Self::Bgra => Some(Self::Bgrx),
            Self::Abgr => Some(Self::Xbgr),
            Self::Rgba => Some(Self::Rgbx),
            Self::Argb => Some(Self::Xrgb),
            Self::Argb210Le => Some(Self::Xrgb210Le),
            Self::Abgr210Le => Some(Self::Xbgr210Le),
            Self::Rgba102Le => Some(Self::Rgbx102Le),
            Self::Bgra102Le => Some(Self::Bgrx102Le),
            _ => None,
        }
    }
}

const WL_SHM_FORMAT_ARGB8888: u32 = 0;
const WL_SHM_FORMAT_XRGB8888: u32 = 1;

/// DRM fourcc code for a `wl_shm` format code.
///
/// `wl_shm` uses fourcc codes for everything except its two original formats.
pub fn drm_from_wl_shm(code: u32) -> u32 {
    match code {
        WL_SHM_FORMAT_ARGB8888 => DrmFourcc::Argb8888 as u32,
        WL_SHM_FORMAT_XRGB8888 => DrmFourcc::Xrgb8888 as u32,
        other => other,
    }
}

/// `wl_shm` format code for a DRM fourcc code.
pub fn wl_shm_from_drm(code: u32) -> u32 {
    if code == DrmFourcc::Argb8888 as u32 {
        WL_SHM_FORMAT_ARGB8888
    } else if code == DrmFourcc::Xrgb8888 as u32 {
        WL_SHM_FORMAT_XRGB8888
    } else {
        code
    }
}
