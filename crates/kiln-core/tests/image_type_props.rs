//! Property checks for the image type algebra.

use kiln_core::prelude::UVec4;
use kiln_core::{Config, ImageDataType, ImageFormat, ImageType};

fn dims() -> Vec<UVec4> {
    vec![
        UVec4::new(1, 1, 0, 0),
        UVec4::new(2, 3, 0, 0),
        UVec4::new(17, 5, 0, 0),
        UVec4::new(256, 256, 0, 0),
        UVec4::new(640, 480, 0, 0),
        UVec4::new(1920, 1080, 0, 0),
        UVec4::new(4096, 1, 0, 0),
    ]
}

#[test]
fn mip_chain_size_is_bounded_by_twice_the_base_level() {
    for t in [ImageType::RGBA8UI_NORM, ImageType::R32F, ImageType::RGBA16F] {
        let t = t | ImageType::FLAG_MIPMAPPED;
        for dim in dims() {
            let base = t.data_size(dim, true);
            let full = t.data_size(dim, false);
            assert!(base <= full, "{t} {dim}");
            assert!(full <= 2 * base, "{t} {dim}: {full} > 2 * {base}");
        }
    }
}

#[test]
fn mip_count_matches_log2_of_max_dim() {
    let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED;
    for dim in dims() {
        let max_dim = dim.x.max(dim.y);
        let expected = (max_dim as f64).log2().floor() as u32 + 1;
        assert_eq!(t.mip_level_count(dim), expected, "{dim}");
        assert_eq!(ImageType::RGBA8UI_NORM.mip_level_count(dim), 1);
    }

    let t3d = ImageType::IMAGE_3D | ImageType::CHANNELS_1 | ImageType::FORMAT_8 | ImageType::FLAG_MIPMAPPED;
    assert_eq!(t3d.mip_level_count(UVec4::new(4, 4, 64, 0)), 7);
}

#[test]
fn format_validity_follows_required_channels() {
    let packed = [
        (ImageType::FORMAT_3_3_2, 3),
        (ImageType::FORMAT_5_6_5, 3),
        (ImageType::FORMAT_5_5_5_A1, 4),
        (ImageType::FORMAT_10_10_10_A2, 4),
        (ImageType::FORMAT_11_11_10, 3),
        (ImageType::FORMAT_24_8, 2),
        (ImageType::FORMAT_32_8, 2),
    ];
    let channels = [
        ImageType::CHANNELS_1,
        ImageType::CHANNELS_2,
        ImageType::CHANNELS_3,
        ImageType::CHANNELS_4,
    ];
    for (format, required) in packed {
        for (i, ch) in channels.iter().enumerate() {
            let t = ImageType::IMAGE_2D | format | *ch;
            assert_eq!(t.is_format_valid(), i as u32 + 1 == required, "{t}");
        }
    }
    for ch in channels {
        assert!((ImageType::IMAGE_2D | ImageType::FORMAT_16 | ch).is_format_valid());
    }
}

#[test]
fn getters_return_packed_fields() {
    let t = ImageType::CHANNELS_2 | ImageType::DIM_3D | ImageType::FORMAT_10_10_10_A2 | ImageType::INT;
    assert_eq!(t.channel_count(), 2);
    assert_eq!(t.dim_count(), 3);
    assert_eq!(t.format(), ImageFormat::F10_10_10A2);
    assert_eq!(t.data_type(), ImageDataType::Int);
}

#[test]
fn rgba8_mipmapped_256_image() {
    let t = ImageType::RGBA8UI_NORM | ImageType::FLAG_MIPMAPPED;
    let dim = UVec4::new(256, 256, 0, 0);
    assert_eq!(t.mip_level_count(dim), 9);
    let expected: u64 = (0..9).map(|l| (256u64 >> l) * (256u64 >> l) * 4).sum();
    assert_eq!(t.data_size(dim, false), expected);
}

#[test]
fn cube_array_size_counts_all_faces() {
    let t = ImageType::IMAGE_CUBE_ARRAY | ImageType::CHANNELS_4 | ImageType::FORMAT_8 | ImageType::UINT;
    let dim = UVec4::new(16, 16, 3, 0);
    assert_eq!(t.layer_count(dim), 18);
    assert_eq!(t.data_size(dim, false), 16 * 16 * 4 * 18);
}

#[test]
fn config_loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kiln.json");
    std::fs::write(&path, r#"{ "vulkan": { "no_blocking": true }, "compute": { "whitelist": ["gpu"] } }"#).unwrap();
    let config = Config::load(&path).unwrap();
    assert!(config.vulkan.no_blocking);
    assert_eq!(config.compute.whitelist, vec!["gpu".to_string()]);
}
