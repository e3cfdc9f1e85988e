//! SPA pod encoding of the negotiation parameters.

use std::io::Cursor;
use std::mem::size_of;

use libspa::param::format::{FormatProperties, MediaSubtype, MediaType};
use libspa::param::video::VideoFormat;
use libspa::param::ParamType;
use libspa::pod::deserialize::PodDeserializer;
use libspa::pod::serialize::PodSerializer;
use libspa::pod::{ChoiceValue, Object, Property, PropertyFlags, Value};
use libspa::utils::{Choice, ChoiceEnum, ChoiceFlags, Fraction, Id, Rectangle, SpaTypes};

use drm_fourcc::DrmModifier;

use crate::cast::negotiate::{
    BufferRequirements, DataType, FormatChoice, FormatProposal, ModifierChoice, ModifierOffer,
    ParamsUpdate, StreamFormat,
};
use crate::cast::{CastError, PixelFormat};

pub fn spa_format(format: PixelFormat) -> VideoFormat {
    match format {
        PixelFormat::Bgra => VideoFormat::BGRA,
        PixelFormat::Bgrx => VideoFormat::BGRx,
        PixelFormat::Abgr => VideoFormat::ABGR,
        PixelFormat::Xbgr => VideoFormat::xBGR,
        PixelFormat::Rgba => VideoFormat::RGBA,
        PixelFormat::Rgbx => VideoFormat::RGBx,
        PixelFormat::Argb => VideoFormat::ARGB,
        PixelFormat::Xrgb => VideoFormat::xRGB,
        PixelFormat::Nv12 => VideoFormat::NV12,
        PixelFormat::Xrgb210Le => VideoFormat::xRGB_210LE,
        PixelFormat::Xbgr210Le => VideoFormat::xBGR_210LE,
        PixelFormat::Rgbx102Le => VideoFormat::RGBx_102LE,
        PixelFormat::Bgrx102Le => VideoFormat::BGRx_102LE,
        PixelFormat::Argb210Le => VideoFormat::ARGB_210LE,
        PixelFormat::Abgr210Le => VideoFormat::ABGR_210LE,
        PixelFormat::Rgba102Le => VideoFormat::RGBA_102LE,
        PixelFormat::Bgra102Le => VideoFormat::BGRA_102LE,
        PixelFormat::Rgb => VideoFormat::RGB,
        PixelFormat::Bgr => VideoFormat::BGR,
    }
}

const ALL_FORMATS: [PixelFormat; 19] = [
    PixelFormat::Bgra,
    PixelFormat::Bgrx,
    PixelFormat::Abgr,
    PixelFormat::Xbgr,
    PixelFormat::Rgba,
    PixelFormat::Rgbx,
    PixelFormat::Argb,
    PixelFormat::Xrgb,
    PixelFormat::Nv12,
    PixelFormat::Xrgb210Le,
    PixelFormat::Xbgr210Le,
    PixelFormat::Rgbx102Le,
    PixelFormat::Bgrx102Le,
    PixelFormat::Argb210Le,
    PixelFormat::Abgr210Le,
    PixelFormat::Rgba102Le,
    PixelFormat::Bgra102Le,
    PixelFormat::Rgb,
    PixelFormat::Bgr,
];

pub fn pixel_format(raw: u32) -> Option<PixelFormat> {
    ALL_FORMATS
        .iter()
        .copied()
        .find(|f| spa_format(*f).as_raw() == raw)
}

fn prop(key: FormatProperties, value: Value) -> Property {
    Property::new(key.as_raw(), value)
}

fn modifier_value(modifier: DrmModifier) -> i64 {
    u64::from(modifier) as i64
}

/// `EnumFormat` object for one proposal.
pub fn format_object(proposal: &FormatProposal) -> Object {
    let mut properties = vec![
        prop(
            FormatProperties::MediaType,
            Value::Id(Id(MediaType::Video.as_raw())),
        ),
        prop(
            FormatProperties::MediaSubtype,
            Value::Id(Id(MediaSubtype::Raw.as_raw())),
        ),
    ];

    let format = match &proposal.format {
        FormatChoice::Fixed(f) => Value::Id(Id(spa_format(*f).as_raw())),
        FormatChoice::Enum {
            default,
            alternatives,
        } => Value::Choice(ChoiceValue::Id(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Enum {
                default: Id(spa_format(*default).as_raw()),
                alternatives: alternatives
                    .iter()
                    .map(|f| Id(spa_format(*f).as_raw()))
                    .collect(),
            },
        ))),
    };
    properties.push(prop(FormatProperties::VideoFormat, format));

    match &proposal.modifiers {
        Some(ModifierChoice::Enumerated(modifiers)) if !modifiers.is_empty() => {
            let values: Vec<i64> = modifiers.iter().map(|m| modifier_value(*m)).collect();
            properties.push(Property {
                key: FormatProperties::VideoModifier.as_raw(),
                flags: PropertyFlags::MANDATORY | PropertyFlags::DONT_FIXATE,
                value: Value::Choice(ChoiceValue::Long(Choice(
                    ChoiceFlags::empty(),
                    ChoiceEnum::Enum {
                        default: values[0],
                        alternatives: values,
                    },
                ))),
            });
        }
        Some(ModifierChoice::Fixed(modifier)) => properties.push(Property {
            key: FormatProperties::VideoModifier.as_raw(),
            flags: PropertyFlags::MANDATORY,
            value: Value::Long(modifier_value(*modifier)),
        }),
        _ => {}
    }

    properties.push(prop(
        FormatProperties::VideoSize,
        Value::Rectangle(Rectangle {
            width: proposal.width,
            height: proposal.height,
        }),
    ));
    // Variable frame rate
    properties.push(prop(
        FormatProperties::VideoFramerate,
        Value::Fraction(Fraction { num: 0, denom: 1 }),
    ));
    properties.push(prop(
        FormatProperties::VideoMaxFramerate,
        Value::Choice(ChoiceValue::Fraction(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Range {
                default: Fraction {
                    num: proposal.max_framerate,
                    denom: 1,
                },
                min: Fraction { num: 1, denom: 1 },
                max: Fraction {
                    num: proposal.max_framerate,
                    denom: 1,
                },
            },
        ))),
    ));

    Object {
        type_: SpaTypes::ObjectParamFormat.as_raw(),
        id: ParamType::EnumFormat.as_raw(),
        properties,
    }
}

fn int_range(default: u32, min: u32, max: u32) -> Value {
    Value::Choice(ChoiceValue::Int(Choice(
        ChoiceFlags::empty(),
        ChoiceEnum::Range {
            default: default as i32,
            min: min as i32,
            max: max as i32,
        },
    )))
}

fn data_type_bit(data_type: DataType) -> i32 {
    let bit = match data_type {
        DataType::MemFd => libspa_sys::SPA_DATA_MemFd,
        DataType::DmaBuf => libspa_sys::SPA_DATA_DmaBuf,
    };
    1 << bit
}

/// `Buffers` object for the negotiated pool.
pub fn buffers_object(req: &BufferRequirements) -> Object {
    let (default, min, max) = req.buffers;
    let mut properties = vec![
        Property::new(
            libspa_sys::SPA_PARAM_BUFFERS_buffers,
            int_range(default, min, max),
        ),
        Property::new(
            libspa_sys::SPA_PARAM_BUFFERS_blocks,
            Value::Int(req.blocks as i32),
        ),
    ];
    if req.size > 0 {
        properties.push(Property::new(
            libspa_sys::SPA_PARAM_BUFFERS_size,
            Value::Int(req.size as i32),
        ));
    }
    if req.stride > 0 {
        properties.push(Property::new(
            libspa_sys::SPA_PARAM_BUFFERS_stride,
            Value::Int(req.stride as i32),
        ));
    }
    properties.push(Property::new(
        libspa_sys::SPA_PARAM_BUFFERS_align,
        Value::Int(req.align as i32),
    ));
    properties.push(Property::new(
        libspa_sys::SPA_PARAM_BUFFERS_dataType,
        Value::Choice(ChoiceValue::Int(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Flags {
                default: data_type_bit(req.data_type),
                flags: Vec::new(),
            },
        ))),
    ));

    Object {
        type_: SpaTypes::ObjectParamBuffers.as_raw(),
        id: ParamType::Buffers.as_raw(),
        properties,
    }
}

fn meta_object(meta_type: u32, size: Value) -> Object {
    Object {
        type_: SpaTypes::ObjectParamMeta.as_raw(),
        id: ParamType::Meta.as_raw(),
        properties: vec![
            Property::new(libspa_sys::SPA_PARAM_META_type, Value::Id(Id(meta_type))),
            Property::new(libspa_sys::SPA_PARAM_META_size, size),
        ],
    }
}

/// Header, video transform and damage metadata requested on every buffer.
pub fn meta_objects(req: &BufferRequirements) -> Vec<Object> {
    let region = size_of::<libspa_sys::spa_meta_region>() as u32;
    let (max_regions, min_regions) = req.damage_regions;
    vec![
        meta_object(
            libspa_sys::SPA_META_Header,
            Value::Int(size_of::<libspa_sys::spa_meta_header>() as i32),
        ),
        meta_object(
            libspa_sys::SPA_META_VideoTransform,
            Value::Int(size_of::<libspa_sys::spa_meta_videotransform>() as i32),
        ),
        meta_object(
            libspa_sys::SPA_META_VideoDamage,
            int_range(region * max_regions, region * min_regions, region * max_regions),
        ),
    ]
}

fn serialize(object: Object) -> Result<Vec<u8>, CastError> {
    PodSerializer::serialize(Cursor::new(Vec::new()), &Value::Object(object))
        .map(|(cursor, _)| cursor.into_inner())
        .map_err(|e| CastError::InvalidParameters(format!("pod serialization failed: {:?}", e)))
}

/// Serialized params for a stream update, in publishing order.
pub fn params_pods(update: &ParamsUpdate) -> Result<Vec<Vec<u8>>, CastError> {
    let objects = match update {
        ParamsUpdate::Formats(proposals) => proposals.iter().map(format_object).collect(),
        ParamsUpdate::Buffers(req) => {
            let mut objects = vec![buffers_object(req)];
            objects.extend(meta_objects(req));
            objects
        }
    };
    objects.into_iter().map(serialize).collect()
}

/// Value of a plain property, or the default entry of a choice.
macro_rules! default_of {
    ($value:expr, $plain:path, $choice:path) => {
        match $value {
            $plain(v) => Some(*v),
            Value::Choice($choice(Choice(_, choice))) => Some(match choice {
                ChoiceEnum::None(v) => *v,
                ChoiceEnum::Range { default, .. }
                | ChoiceEnum::Step { default, .. }
                | ChoiceEnum::Enum { default, .. }
                | ChoiceEnum::Flags { default, .. } => *default,
            }),
            _ => None,
        }
    };
}

fn id_default(value: &Value) -> Option<u32> {
    default_of!(value, Value::Id, ChoiceValue::Id).map(|id: Id| id.0)
}

fn rectangle_default(value: &Value) -> Option<Rectangle> {
    default_of!(value, Value::Rectangle, ChoiceValue::Rectangle)
}

fn fraction_default(value: &Value) -> Option<Fraction> {
    default_of!(value, Value::Fraction, ChoiceValue::Fraction)
}

fn modifier_offer(property: &Property) -> Option<ModifierOffer> {
    if property.flags.contains(PropertyFlags::DONT_FIXATE) {
        if let Value::Choice(ChoiceValue::Long(Choice(_, ChoiceEnum::Enum { alternatives, .. }))) =
            &property.value
        {
            // The default entry only repeats one of the alternatives
            return Some(ModifierOffer::Unfixated(
                alternatives
                    .iter()
                    .map(|m| DrmModifier::from(*m as u64))
                    .collect(),
            ));
        }
    }
    default_of!(&property.value, Value::Long, ChoiceValue::Long)
        .map(|m: i64| ModifierOffer::Fixed(DrmModifier::from(m as u64)))
}

/// Read the consumer's choice out of a `Format` object.
pub fn parse_format_object(object: &Object) -> Result<StreamFormat, CastError> {
    let mut format = None;
    let mut size = None;
    let mut max_framerate = None;
    let mut modifier = None;

    for property in &object.properties {
        let key = property.key;
        if key == FormatProperties::MediaType.as_raw() {
            if id_default(&property.value) != Some(MediaType::Video.as_raw()) {
                return Err(CastError::InvalidParameters("not a video format".into()));
            }
        } else if key == FormatProperties::VideoFormat.as_raw() {
            let raw = id_default(&property.value)
                .ok_or_else(|| CastError::InvalidParameters("malformed video format".into()))?;
            format = Some(pixel_format(raw).ok_or_else(|| {
                CastError::InvalidParameters(format!("unsupported video format {}", raw))
            })?);
        } else if key == FormatProperties::VideoSize.as_raw() {
            size = rectangle_default(&property.value);
        } else if key == FormatProperties::VideoMaxFramerate.as_raw() {
            max_framerate = fraction_default(&property.value);
        } else if key == FormatProperties::VideoModifier.as_raw() {
            modifier = modifier_offer(property);
        }
    }

    let format = format.ok_or_else(|| CastError::InvalidParameters("format has no pixel format".into()))?;
    let size = size.ok_or_else(|| CastError::InvalidParameters("format has no size".into()))?;
    let max_framerate = max_framerate.unwrap_or(Fraction { num: 0, denom: 1 });

    Ok(StreamFormat {
        format,
        width: size.width,
        height: size.height,
        max_framerate: (max_framerate.num, max_framerate.denom),
        modifier,
    })
}

/// Parse a serialized `Format` param.
pub fn parse_stream_format(bytes: &[u8]) -> Result<StreamFormat, CastError> {
    let (_, value) = PodDeserializer::deserialize_any_from(bytes)
        .map_err(|e| CastError::InvalidParameters(format!("malformed format pod: {:?}", e)))?;
    match value {
        Value::Object(object) => parse_format_object(&object),
        _ => Err(CastError::InvalidParameters("format param is not an object".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cast::buffer::BufferType;
    use crate::cast::negotiate::{
        BUFFER_ALIGN, BUFFER_COUNT_DEFAULT, BUFFER_COUNT_MAX, BUFFER_COUNT_MIN,
        DAMAGE_REGIONS_MAX, DAMAGE_REGIONS_MIN,
    };

    fn property<'a>(object: &'a Object, key: u32) -> Option<&'a Property> {
        object.properties.iter().find(|p| p.key == key)
    }

    #[test]
    fn test_format_mapping_is_bijective() {
        for format in ALL_FORMATS {
            assert_eq!(pixel_format(spa_format(format).as_raw()), Some(format));
        }
        assert_eq!(pixel_format(VideoFormat::YUY2.as_raw()), None);
    }

    #[test]
    fn test_shm_proposal_offers_alpha_and_opaque() {
        let proposal = FormatProposal {
            buffer_type: BufferType::Shm,
            format: FormatChoice::Enum {
                default: PixelFormat::Bgra,
                alternatives: vec![PixelFormat::Bgra, PixelFormat::Bgrx],
            },
            modifiers: None,
            width: 1920,
            height: 1080,
            max_framerate: 60,
        };
        let object = format_object(&proposal);

        assert!(property(&object, FormatProperties::VideoModifier.as_raw()).is_none());
        let format = property(&object, FormatProperties::VideoFormat.as_raw()).unwrap();
        match &format.value {
            Value::Choice(ChoiceValue::Id(Choice(_, ChoiceEnum::Enum { default, alternatives }))) => {
                assert_eq!(default.0, VideoFormat::BGRA.as_raw());
                assert_eq!(alternatives.len(), 2);
                assert_eq!(alternatives[1].0, VideoFormat::BGRx.as_raw());
            }
            other => panic!("unexpected format value {:?}", other),
        }
        let max = property(&object, FormatProperties::VideoMaxFramerate.as_raw()).unwrap();
        assert_eq!(fraction_default(&max.value), Some(Fraction { num: 60, denom: 1 }));
    }

    #[test]
    fn test_dmabuf_proposal_modifiers_are_not_fixated() {
        let modifiers = vec![DrmModifier::Linear, DrmModifier::Invalid];
        let proposal = FormatProposal {
            buffer_type: BufferType::Dmabuf,
            format: FormatChoice::Fixed(PixelFormat::Bgrx),
            modifiers: Some(ModifierChoice::Enumerated(modifiers.clone())),
            width: 2560,
            height: 1440,
            max_framerate: 144,
        };
        let object = format_object(&proposal);
        let modifier = property(&object, FormatProperties::VideoModifier.as_raw()).unwrap();
        assert!(modifier.flags.contains(PropertyFlags::MANDATORY | PropertyFlags::DONT_FIXATE));

        // Echoed back by a consumer that did not fixate
        let parsed = parse_format_object(&object).unwrap();
        assert_eq!(parsed.format, PixelFormat::Bgrx);
        assert_eq!((parsed.width, parsed.height), (2560, 1440));
        assert_eq!(parsed.framerate(), 144);
        assert_eq!(parsed.modifier, Some(ModifierOffer::Unfixated(modifiers)));
    }

    #[test]
    fn test_fixed_modifier_parses_as_fixed() {
        let object = Object {
            type_: SpaTypes::ObjectParamFormat.as_raw(),
            id: ParamType::Format.as_raw(),
            properties: vec![
                prop(FormatProperties::MediaType, Value::Id(Id(MediaType::Video.as_raw()))),
                prop(FormatProperties::VideoFormat, Value::Id(Id(VideoFormat::BGRA.as_raw()))),
                Property {
                    key: FormatProperties::VideoModifier.as_raw(),
                    flags: PropertyFlags::MANDATORY,
                    value: Value::Long(0),
                },
                prop(
                    FormatProperties::VideoSize,
                    Value::Rectangle(Rectangle {
                        width: 800,
                        height: 600,
                    }),
                ),
            ],
        };
        let parsed = parse_format_object(&object).unwrap();
        assert_eq!(parsed.modifier, Some(ModifierOffer::Fixed(DrmModifier::Linear)));
        assert_eq!(parsed.max_framerate, (0, 1));
    }

    #[test]
    fn test_format_without_size_is_rejected() {
        let object = Object {
            type_: SpaTypes::ObjectParamFormat.as_raw(),
            id: ParamType::Format.as_raw(),
            properties: vec![prop(
                FormatProperties::VideoFormat,
                Value::Id(Id(VideoFormat::BGRx.as_raw())),
            )],
        };
        assert!(matches!(
            parse_format_object(&object),
            Err(CastError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_buffers_params() {
        let req = BufferRequirements {
            buffer_type: BufferType::Shm,
            data_type: DataType::MemFd,
            blocks: 1,
            size: 1920 * 4 * 1080,
            stride: 1920 * 4,
            align: BUFFER_ALIGN,
            buffers: (BUFFER_COUNT_DEFAULT, BUFFER_COUNT_MIN, BUFFER_COUNT_MAX),
            damage_regions: (DAMAGE_REGIONS_MAX, DAMAGE_REGIONS_MIN),
        };
        let pods = params_pods(&ParamsUpdate::Buffers(req.clone())).unwrap();
        assert_eq!(pods.len(), 4);

        let object = buffers_object(&req);
        let data_type = property(&object, libspa_sys::SPA_PARAM_BUFFERS_dataType).unwrap();
        match &data_type.value {
            Value::Choice(ChoiceValue::Int(Choice(_, ChoiceEnum::Flags { default, .. }))) => {
                assert_eq!(*default, 1 << libspa_sys::SPA_DATA_MemFd);
            }
            other => panic!("unexpected data type value {:?}", other),
        }

        let unknown_size = BufferRequirements {
            size: 0,
            stride: 0,
            ..req
        };
        let object = buffers_object(&unknown_size);
        assert!(property(&object, libspa_sys::SPA_PARAM_BUFFERS_size).is_none());
        assert!(property(&object, libspa_sys::SPA_PARAM_BUFFERS_stride).is_none());
    }

    #[test]
    fn test_serialized_format_parses_back() {
        let proposal = FormatProposal {
            buffer_type: BufferType::Shm,
            format: FormatChoice::Fixed(PixelFormat::Rgb),
            modifiers: None,
            width: 640,
            height: 480,
            max_framerate: 30,
        };
        let pods = params_pods(&ParamsUpdate::Formats(vec![proposal])).unwrap();
        let parsed = parse_stream_format(&pods[0]).unwrap();
        assert_eq!(parsed.format, PixelFormat::Rgb);
        assert_eq!(parsed.modifier, None);
        assert_eq!(parsed.framerate(), 30);
    }
}
