//! Throughput of the generated kernels across bit rates and block sizes,
//! with the scalar reference as the baseline.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sls_kernels::{embedding_sls_nbit_ref, generate_nbit_sls, quantize_rows_nbit};

const ROWS: usize = 10_000;
const BAGS: usize = 256;
const BAG_LEN: i32 = 32;

fn bench_sls(c: &mut Criterion) {
    let mut group = c.benchmark_group("nbit_sls");
    let mut rng = StdRng::seed_from_u64(42);

    for &bit_rate in &[2i32, 4] {
        for &block in &[64usize, 128] {
            let values: Vec<f32> = (0..ROWS * block).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let data = quantize_rows_nbit(bit_rate as usize, &values, ROWS, block);
            let lengths = vec![BAG_LEN; BAGS];
            let indices: Vec<i64> = (0..BAGS * BAG_LEN as usize)
                .map(|_| rng.gen_range(0..ROWS as i64))
                .collect();

            let kernel =
                generate_nbit_sls::<i64>(bit_rate, block as i64, false, false, 16, false).unwrap();
            let mut out = vec![0.0f32; BAGS * block];

            group.throughput(Throughput::Elements((BAGS * BAG_LEN as usize) as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("jit_{bit_rate}bit"), block),
                &block,
                |b, _| {
                    b.iter(|| {
                        let ok = kernel.execute(
                            ROWS as i64,
                            black_box(&data),
                            black_box(&indices),
                            &lengths,
                            None,
                            &mut out,
                        );
                        debug_assert!(ok);
                        black_box(&out);
                    })
                },
            );

            let mut ref_out = vec![0.0f32; BAGS * block];
            group.bench_with_input(
                BenchmarkId::new(format!("scalar_{bit_rate}bit"), block),
                &block,
                |b, _| {
                    b.iter(|| {
                        let ok = embedding_sls_nbit_ref::<i64>(
                            bit_rate as usize,
                            block,
                            ROWS as i64,
                            black_box(&data),
                            black_box(&indices),
                            &lengths,
                            None,
                            false,
                            false,
                            &mut ref_out,
                        );
                        debug_assert!(ok);
                        black_box(&ref_out);
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_sls);
criterion_main!(benches);
