//! Format negotiation between compositor buffer constraints and the stream.
//!
//! The negotiator proposes a GPU-shared (dmabuf) format with every modifier
//! the GPU can realize, followed by a shared-memory fallback. When the
//! consumer picks a format whose modifier is not fixated yet, a probe
//! allocation decides the modifier and the format list is republished with
//! that single modifier. If no probe succeeds, GPU transport is switched off
//! for the rest of the session.

use std::rc::Rc;

use drm_fourcc::DrmModifier;

use super::buffer::{BufferDescriptor, BufferType, GpuDevice};
use super::error::CastError;
use super::format::PixelFormat;

pub const BUFFER_COUNT_DEFAULT: u32 = 2;
pub const BUFFER_COUNT_MIN: u32 = 2;
pub const BUFFER_COUNT_MAX: u32 = 32;
pub const BUFFER_ALIGN: u32 = 16;
pub const DAMAGE_REGIONS_MIN: u32 = 1;
pub const DAMAGE_REGIONS_MAX: u32 = 4;

/// Frame rate proposed when neither the output nor the config gives one.
pub const DEFAULT_FRAMERATE: u32 = 60;

/// Pixel format advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatChoice {
    Fixed(PixelFormat),
    /// Enumeration; `alternatives` repeats the default as its first entry.
    Enum {
        default: PixelFormat,
        alternatives: Vec<PixelFormat>,
    },
}

impl FormatChoice {
    pub fn preferred(&self) -> PixelFormat {
        match self {
            FormatChoice::Fixed(f) => *f,
            FormatChoice::Enum { default, .. } => *default,
        }
    }
}

/// Modifier advertisement attached to a GPU proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifierChoice {
    /// Mandatory, not fixated: the consumer narrows the list and we fixate.
    Enumerated(Vec<DrmModifier>),
    /// Mandatory single modifier.
    Fixed(DrmModifier),
}

/// One entry of the format list published on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatProposal {
    pub buffer_type: BufferType,
    pub format: FormatChoice,
    pub modifiers: Option<ModifierChoice>,
    pub width: u32,
    pub height: u32,
    pub max_framerate: u32,
}

/// Modifier property of a format chosen by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifierOffer {
    Fixed(DrmModifier),
    /// Still carries the "don't fixate" flag; the values exclude the default entry.
    Unfixated(Vec<DrmModifier>),
}

/// Format chosen by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Ceiling as `num / denom`
    pub max_framerate: (u32, u32),
    pub modifier: Option<ModifierOffer>,
}

impl StreamFormat {
    pub fn framerate(&self) -> u32 {
        let (num, denom) = self.max_framerate;
        if denom == 0 {
            0
        } else {
            num / denom
        }
    }
}

/// Bit in the stream's data-type mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    MemFd,
    DmaBuf,
}

/// Buffer pool requirements published once a format is fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRequirements {
    pub buffer_type: BufferType,
    pub data_type: DataType,
    /// Planes per buffer
    pub blocks: u32,
    /// Zero when unknown
    pub size: u32,
    /// Zero when unknown
    pub stride: u32,
    pub align: u32,
    /// (default, min, max)
    pub buffers: (u32, u32, u32),
    /// Damage metadata slots as (max, min)
    pub damage_regions: (u32, u32),
}

/// What the stream must publish after a negotiation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamsUpdate {
    Formats(Vec<FormatProposal>),
    Buffers(BufferRequirements),
}

/// Format currently agreed with the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub buffer_type: BufferType,
    pub format: PixelFormat,
    pub modifier: DrmModifier,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct NegotiationConfig {
    /// Frame rate to propose as ceiling
    pub framerate: u32,
    /// Never offer dmabuf
    pub disable_dmabuf: bool,
    /// Implicit modifiers allocate linear buffers
    pub force_linear: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            framerate: DEFAULT_FRAMERATE,
            disable_dmabuf: false,
            force_linear: false,
        }
    }
}

pub struct FormatNegotiator {
    shm: BufferDescriptor,
    dmabuf: BufferDescriptor,
    /// (fourcc, modifier) pairs advertised by the compositor
    compositor_modifiers: Vec<(u32, DrmModifier)>,
    gpu: Option<Rc<dyn GpuDevice>>,
    avoid_dmabufs: bool,
    force_linear: bool,
    framerate: u32,
    fixated: Option<DrmModifier>,
    negotiated: Option<NegotiatedFormat>,
}

impl FormatNegotiator {
    pub fn new(gpu: Option<Rc<dyn GpuDevice>>, config: NegotiationConfig) -> Self {
        Self {
            shm: BufferDescriptor::default(),
            dmabuf: BufferDescriptor::default(),
            compositor_modifiers: Vec::new(),
            gpu,
            avoid_dmabufs: config.disable_dmabuf,
            force_linear: config.force_linear,
            framerate: config.framerate,
            fixated: None,
            negotiated: None,
        }
    }

    /// Overwrite the constraints of one transport. Last report wins.
    pub fn update_descriptor(&mut self, buffer_type: BufferType, desc: BufferDescriptor) {
        match buffer_type {
            BufferType::Shm => self.shm = desc,
            BufferType::Dmabuf => self.dmabuf = desc,
        }
    }

    pub fn descriptor(&self, buffer_type: BufferType) -> &BufferDescriptor {
        match buffer_type {
            BufferType::Shm => &self.shm,
            BufferType::Dmabuf => &self.dmabuf,
        }
    }

    pub fn set_compositor_modifiers(&mut self, modifiers: Vec<(u32, DrmModifier)>) {
        self.compositor_modifiers = modifiers;
    }

    pub fn dmabuf_disabled(&self) -> bool {
        self.avoid_dmabufs
    }

    /// Switch GPU transport off for the rest of the session.
    pub fn disable_dmabuf(&mut self) {
        if !self.avoid_dmabufs {
            tracing::warn!("disabling dmabuf transport, falling back to shm");
        }
        self.avoid_dmabufs = true;
    }

    pub fn framerate(&self) -> u32 {
        self.framerate
    }

    pub fn fixated_modifier(&self) -> Option<DrmModifier> {
        self.fixated
    }

    pub fn negotiated(&self) -> Option<&NegotiatedFormat> {
        self.negotiated.as_ref()
    }

    /// Compositor modifiers for `format` that the GPU device can realize.
    pub fn modifier_list(&self, format: u32) -> Vec<DrmModifier> {
        let Some(gpu) = &self.gpu else {
            return Vec::new();
        };
        let mut list = Vec::new();
        for &(fourcc, modifier) in &self.compositor_modifiers {
            if fourcc != format || list.contains(&modifier) {
                continue;
            }
            let usable = modifier == DrmModifier::Invalid
                || gpu
                    .modifier_plane_count(fourcc, modifier)
                    .is_some_and(|n| n > 0);
            if usable {
                list.push(modifier);
            }
        }
        list
    }

    /// Ordered format list: dmabuf first when usable, then shm.
    pub fn proposals(&self) -> Vec<FormatProposal> {
        let mut proposals = Vec::with_capacity(2);

        if !self.avoid_dmabufs && self.dmabuf.is_known() {
            let modifiers = self.modifier_list(self.dmabuf.format);
            if !modifiers.is_empty() {
                if let Some(p) = self.proposal(
                    BufferType::Dmabuf,
                    Some(ModifierChoice::Enumerated(modifiers)),
                ) {
                    proposals.push(p);
                }
            }
        }

        if let Some(p) = self.proposal(BufferType::Shm, None) {
            proposals.push(p);
        }
        proposals
    }

    fn proposal(
        &self,
        buffer_type: BufferType,
        modifiers: Option<ModifierChoice>,
    ) -> Option<FormatProposal> {
        let desc = self.descriptor(buffer_type);
        if !desc.is_known() {
            return None;
        }
        let Some(format) = PixelFormat::from_drm_code(desc.format) else {
            tracing::warn!(
                "compositor {} format {:#010x} has no stream equivalent",
                buffer_type.as_str(),
                desc.format
            );
            return None;
        };

        let format = match (format.strip_alpha(), &modifiers) {
            (Some(stripped), None) => FormatChoice::Enum {
                default: format,
                alternatives: vec![format, stripped],
            },
            _ => FormatChoice::Fixed(format),
        };

        Some(FormatProposal {
            buffer_type,
            format,
            modifiers,
            width: desc.width,
            height: desc.height,
            max_framerate: self.framerate,
        })
    }

    /// React to the format the consumer chose.
    pub fn on_stream_format(&mut self, chosen: &StreamFormat) -> Result<ParamsUpdate, CastError> {
        let framerate = chosen.framerate();
        if framerate > 0 {
            self.framerate = framerate;
        }

        match &chosen.modifier {
            Some(_) if self.avoid_dmabufs => {
                tracing::warn!("consumer picked a dmabuf format after dmabuf was disabled");
                Ok(ParamsUpdate::Formats(self.proposals()))
            }
            Some(ModifierOffer::Unfixated(offered)) => self.fixate(chosen, offered),
            Some(ModifierOffer::Fixed(modifier)) => self.accept_dmabuf(chosen, *modifier),
            None => Ok(self.accept_shm(chosen)),
        }
    }

    fn fixate(
        &mut self,
        chosen: &StreamFormat,
        offered: &[DrmModifier],
    ) -> Result<ParamsUpdate, CastError> {
        let gpu = self
            .gpu
            .clone()
            .ok_or_else(|| CastError::Unsupported("dmabuf format without GPU device".into()))?;

        match self.probe_modifier(gpu.as_ref(), offered) {
            Some(modifier) => {
                tracing::debug!("fixated modifier {:#x}", u64::from(modifier));
                self.fixated = Some(modifier);

                let mut formats = Vec::with_capacity(3);
                if let Some(mut fixed) = self.proposal(BufferType::Dmabuf, None) {
                    fixed.format = FormatChoice::Fixed(chosen.format);
                    fixed.modifiers = Some(ModifierChoice::Fixed(modifier));
                    formats.push(fixed);
                }
                formats.extend(self.proposals());
                Ok(ParamsUpdate::Formats(formats))
            }
            None => {
                tracing::warn!("no offered modifier could be allocated");
                self.disable_dmabuf();
                Ok(ParamsUpdate::Formats(self.proposals()))
            }
        }
    }

    fn probe_modifier(&self, gpu: &dyn GpuDevice, offered: &[DrmModifier]) -> Option<DrmModifier> {
        if !offered.is_empty() {
            match gpu.create_with_modifiers(&self.dmabuf, offered) {
                Ok(bo) => return Some(bo.modifier()),
                Err(e) => tracing::debug!("allocation with offered modifiers failed: {}", e),
            }
        }

        for &modifier in offered {
            let linear = match modifier {
                DrmModifier::Invalid => self.force_linear,
                DrmModifier::Linear => true,
                _ => continue,
            };
            match gpu.create(&self.dmabuf, linear) {
                Ok(bo) => return Some(bo.modifier()),
                Err(e) => tracing::debug!(
                    "allocation for modifier {:#x} failed: {}",
                    u64::from(modifier),
                    e
                ),
            }
        }
        None
    }

    fn accept_dmabuf(
        &mut self,
        chosen: &StreamFormat,
        modifier: DrmModifier,
    ) -> Result<ParamsUpdate, CastError> {
        let gpu = self
            .gpu
            .clone()
            .ok_or_else(|| CastError::Unsupported("dmabuf format without GPU device".into()))?;

        let blocks = if modifier == DrmModifier::Invalid {
            1
        } else {
            gpu.modifier_plane_count(self.dmabuf.format, modifier)
                .filter(|&n| n > 0)
                .unwrap_or(1)
        };

        self.set_negotiated(BufferType::Dmabuf, chosen, modifier);
        Ok(ParamsUpdate::Buffers(self.requirements(
            BufferType::Dmabuf,
            DataType::DmaBuf,
            blocks,
        )))
    }

    fn accept_shm(&mut self, chosen: &StreamFormat) -> ParamsUpdate {
        self.set_negotiated(BufferType::Shm, chosen, DrmModifier::Invalid);
        ParamsUpdate::Buffers(self.requirements(BufferType::Shm, DataType::MemFd, 1))
    }

    fn set_negotiated(&mut self, buffer_type: BufferType, chosen: &StreamFormat, modifier: DrmModifier) {
        let negotiated = NegotiatedFormat {
            buffer_type,
            format: chosen.format,
            modifier,
            width: chosen.width,
            height: chosen.height,
            framerate: self.framerate,
        };
        tracing::info!(
            "negotiated {} {:?} {}x{} @ {} fps, modifier {:#x}",
            buffer_type.as_str(),
            negotiated.format,
            negotiated.width,
            negotiated.height,
            negotiated.framerate,
            u64::from(modifier)
        );
        self.negotiated = Some(negotiated);
    }

    fn requirements(&self, buffer_type: BufferType, data_type: DataType, blocks: u32) -> BufferRequirements {
        let desc = self.descriptor(buffer_type);
        BufferRequirements {
            buffer_type,
            data_type,
            blocks,
            size: desc.size,
            stride: desc.stride,
            align: BUFFER_ALIGN,
            buffers: (BUFFER_COUNT_DEFAULT, BUFFER_COUNT_MIN, BUFFER_COUNT_MAX),
            damage_regions: (DAMAGE_REGIONS_MAX, DAMAGE_REGIONS_MIN),
        }
    }
}
