//! Property-based tests for the dense kernels
//!
//! These tests verify mathematical properties that should hold for all valid inputs

use super::*;
use proptest::prelude::*;

/// Eight finite logits with at least one above 50 and one below -50
fn extreme_lane() -> impl Strategy<Value = Vec<f32>> {
    (
        50.5f32..300.0,
        -300.0f32..-50.5,
        prop::collection::vec(-300.0f32..300.0, 6),
        0usize..8,
        0usize..8,
    )
        .prop_map(|(high, low, mut rest, i, j)| {
            rest.push(high);
            rest.push(low);
            rest.swap(6, i);
            rest.swap(7, j);
            rest
        })
}

fn naive_softmax(x: &[f32]) -> Vec<f64> {
    let exps: Vec<f64> = x.iter().map(|&v| (v as f64).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

proptest! {
    /// Stable softmax sums to one and matches a double precision reference
    #[test]
    fn test_softmax_matches_double_reference(x in extreme_lane()) {
        let mut out = vec![0.0f32; 8];
        softmax_slice(&x, &mut out).unwrap();

        let sum: f32 = out.iter().sum();
        prop_assert!((sum - 1.0).abs() <= 1e-5, "sum = {}", sum);

        for (o, r) in out.iter().zip(naive_softmax(&x)) {
            prop_assert!((*o as f64 - r).abs() < 1e-4, "{} vs {}", o, r);
        }
    }

    /// Row-wise matrix softmax agrees with the slice version lane by lane
    #[test]
    fn test_softmax_rows_match_slices(rows in prop::collection::vec(extreme_lane(), 1..4)) {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        let src = MatRef::from_slice(&flat, rows.len(), 8).unwrap();
        let mut out = vec![0.0f32; flat.len()];
        let mut dst = MatMut::from_slice(&mut out, rows.len(), 8).unwrap();
        softmax(&src, SoftmaxAxis::Rows, &mut dst).unwrap();

        for (r, lane) in rows.iter().enumerate() {
            let mut expected = vec![0.0f32; 8];
            softmax_slice(lane, &mut expected).unwrap();
            prop_assert_eq!(&out[r * 8..(r + 1) * 8], expected.as_slice());
        }
    }

    /// reduce(broadcast(v)) along the broadcast axis equals v times the replica count
    #[test]
    fn test_broadcast_reduce_adjoint(
        v in prop::collection::vec(-10.0f64..10.0, 1..16),
        m in 1usize..16,
    ) {
        let n = v.len();

        let mut wide = vec![0.0; n * m];
        let mut dst = MatMut::from_slice(&mut wide, n, m).unwrap();
        broadcast(&v, BroadcastAxis::Columns, &mut dst).unwrap();

        let mut back = vec![0.0; n];
        reduce(
            &MatRef::from_slice(&wide, n, m).unwrap(),
            BroadcastAxis::Columns,
            &mut back,
        )
        .unwrap();
        for (b, x) in back.iter().zip(&v) {
            prop_assert!((b - x * m as f64).abs() < 1e-9);
        }

        let mut tall = vec![0.0; m * n];
        let mut dst = MatMut::from_slice(&mut tall, m, n).unwrap();
        broadcast(&v, BroadcastAxis::Rows, &mut dst).unwrap();

        reduce(&MatRef::from_slice(&tall, m, n).unwrap(), BroadcastAxis::Rows, &mut back).unwrap();
        for (b, x) in back.iter().zip(&v) {
            prop_assert!((b - x * m as f64).abs() < 1e-9);
        }
    }

    /// Transposing twice restores the matrix for any tile size
    #[test]
    fn test_transpose_involution(rows in 1usize..40, cols in 1usize..40, tile in 1usize..9) {
        let src: Vec<f32> = (0..rows * cols).map(|v| v as f32).collect();
        let mut once = vec![0.0f32; rows * cols];
        let mut twice = vec![0.0f32; rows * cols];

        let s = MatRef::from_slice(&src, rows, cols).unwrap();
        transpose_tiled(&s, &mut MatMut::from_slice(&mut once, cols, rows).unwrap(), tile).unwrap();
        let t = MatRef::from_slice(&once, cols, rows).unwrap();
        transpose_tiled(
            &t,
            &mut MatMut::from_slice(&mut twice, rows, cols).unwrap(),
            tile,
        )
        .unwrap();

        prop_assert_eq!(twice, src);
    }

    /// (A · B)ᵀ = Bᵀ · Aᵀ
    #[test]
    fn test_matmul_transpose_identity(
        (m, k, n) in (1usize..8, 1usize..8, 1usize..8),
        seed in prop::collection::vec(-4i32..4, 128),
    ) {
        let a: Vec<f64> = seed[..m * k].iter().map(|&v| v as f64).collect();
        let b: Vec<f64> = seed[64..64 + k * n].iter().map(|&v| v as f64).collect();

        let mut ab = vec![0.0; m * n];
        matmul(
            &MatRef::from_slice(&a, m, k).unwrap(),
            &MatRef::from_slice(&b, k, n).unwrap(),
            &mut MatMut::from_slice(&mut ab, m, n).unwrap(),
        )
        .unwrap();

        let mut at = vec![0.0; k * m];
        let mut bt = vec![0.0; n * k];
        transpose(
            &MatRef::from_slice(&a, m, k).unwrap(),
            &mut MatMut::from_slice(&mut at, k, m).unwrap(),
        )
        .unwrap();
        transpose(
            &MatRef::from_slice(&b, k, n).unwrap(),
            &mut MatMut::from_slice(&mut bt, n, k).unwrap(),
        )
        .unwrap();

        let mut bt_at = vec![0.0; n * m];
        matmul(
            &MatRef::from_slice(&bt, n, k).unwrap(),
            &MatRef::from_slice(&at, k, m).unwrap(),
            &mut MatMut::from_slice(&mut bt_at, n, m).unwrap(),
        )
        .unwrap();

        for i in 0..m {
            for j in 0..n {
                prop_assert_eq!(ab[i * n + j], bt_at[j * m + i]);
            }
        }
    }
}
