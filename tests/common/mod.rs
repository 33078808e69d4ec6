use yolo_v5n_infer::weights::{WeightSpec, WeightStore, WeightTensor};

/// xorshift による決定的な [-1, 1) の乱数列
pub fn fill(len: usize, seed: u32) -> Vec<f32> {
    let mut s = seed.max(1);
    (0..len)
        .map(|_| {
            s ^= s << 13;
            s ^= s >> 17;
            s ^= s << 5;
            (s % 2001) as f32 / 1000.0 - 1.0
        })
        .collect()
}

/// マニフェストに従って重みを埋めたストアを作ります。
///
/// 畳み込みの重みは fan-in で割り、BN は恒等変換に近い値にして、
/// 深いネットワークでも活性値が O(1) に収まるようにします。
pub fn synthetic_store(manifest: &[WeightSpec], seed: u32) -> WeightStore {
    let tensors = manifest
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let len: usize = spec.dims.iter().product();
            let r = fill(len, seed.wrapping_add(i as u32 * 7919));
            let data: Vec<f32> = if spec.dims.len() == 4 {
                let fan_in = (spec.dims[1] * spec.dims[2] * spec.dims[3]) as f32;
                r.iter().map(|v| v * 1.5 / fan_in.sqrt()).collect()
            } else if spec.name.ends_with("bn.weight") {
                r.iter().map(|v| 1.0 + 0.2 * v).collect()
            } else if spec.name.ends_with("running_var") {
                r.iter().map(|v| 1.0 + 0.5 * v.abs()).collect()
            } else {
                r.iter().map(|v| 0.1 * v).collect()
            };
            WeightTensor::new(spec.name.clone(), spec.dims.clone(), data).unwrap()
        })
        .collect();
    WeightStore::from_tensors(tensors).unwrap()
}
