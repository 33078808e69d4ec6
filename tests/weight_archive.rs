use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use yolo_v5n_infer::weights::{WeightStore, WeightTensor};

fn sample() -> WeightStore {
    WeightStore::from_tensors(vec![
        WeightTensor::new("model.0.conv.weight", vec![2, 1, 1, 1], vec![0.5, -1.5]).unwrap(),
        WeightTensor::new("model.0.conv.bias", vec![2], vec![0.25, 0.75]).unwrap(),
    ])
    .unwrap()
}

fn archive(members: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, &data[..]).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn encoded(store: &WeightStore) -> Vec<u8> {
    let mut buf = Vec::new();
    store.write_to(&mut buf).unwrap();
    buf
}

#[test]
fn loads_bin_member_from_archive() {
    let bytes = archive(&[("README", b"not weights".to_vec()), ("yolov5n.bin", encoded(&sample()))]);
    let store = WeightStore::from_archive(&bytes[..]).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.get("model.0.conv.bias").unwrap(), &[0.25, 0.75]);
    assert_eq!(store.get_shaped("model.0.conv.weight", &[2, 1, 1, 1]).unwrap(), &[0.5, -1.5]);
}

#[test]
fn archive_without_bin_member_is_an_error() {
    let bytes = archive(&[("README", b"nothing here".to_vec())]);
    assert!(WeightStore::from_archive(&bytes[..]).is_err());
}

#[test]
fn load_picks_format_from_extension() {
    let dir = std::env::temp_dir().join(format!("yolo_v5n_infer_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let bin = dir.join("weights.bin");
    std::fs::File::create(&bin).unwrap().write_all(&encoded(&sample())).unwrap();
    let tgz = dir.join("weights.tar.gz");
    std::fs::write(&tgz, archive(&[("w.bin", encoded(&sample()))])).unwrap();

    let a = WeightStore::load(&bin).unwrap();
    let b = WeightStore::load(&tgz).unwrap();
    assert_eq!(a.iter().collect::<Vec<_>>(), b.iter().collect::<Vec<_>>());
    assert!(WeightStore::load(dir.join("missing.bin")).is_err());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn truncated_archive_payload_is_an_error() {
    let mut bin = encoded(&sample());
    bin.truncate(bin.len() - 3);
    let bytes = archive(&[("w.bin", bin)]);
    assert!(WeightStore::from_archive(&bytes[..]).is_err());
}
