//! Dense linear-algebra backend
//!
//! Layers never call a BLAS library directly. They receive a `&dyn Blas`
//! through their call-time bindings, so a network can run on the reference
//! loops in [`NaiveBlas`] or on a system CBLAS ([`CBlas`], cargo feature
//! `blas`) without touching any layer code.
//!
//! All matrices are dense, row-major, single precision. Leading dimensions
//! follow the non-transposed inner size:
//!
//! - `gemm`: `lda = k` (or `m` when `A` is transposed), `ldb = n` (or `k`),
//!   `ldc = n`
//! - `gemv`: `A` is `m × n` with `lda = n`

/// Operand transposition flag for [`Blas::gemm`] and [`Blas::gemv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    No,
    Yes,
}

/// The primitives every numeric backend must supply.
///
/// Accumulation follows BLAS semantics: `C = α·op(A)·op(B) + β·C`. When
/// `β == 0` the previous contents of `C` are ignored (they may be garbage).
pub trait Blas {
    /// `C (m × n) = α·op(A) (m × k) · op(B) (k × n) + β·C`
    #[allow(clippy::too_many_arguments)]
    fn gemm(
        &self,
        trans_a: Transpose,
        trans_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[f32],
        b: &[f32],
        beta: f32,
        c: &mut [f32],
    );

    /// `y = α·op(A)·x + β·y` where `A` is `m × n`.
    ///
    /// With `Transpose::No`, `x` has `n` entries and `y` has `m`; with
    /// `Transpose::Yes` the roles swap.
    #[allow(clippy::too_many_arguments)]
    fn gemv(
        &self,
        trans_a: Transpose,
        m: usize,
        n: usize,
        alpha: f32,
        a: &[f32],
        x: &[f32],
        beta: f32,
        y: &mut [f32],
    );

    /// Strided dot product over `n` elements.
    fn dot(&self, n: usize, x: &[f32], inc_x: usize, y: &[f32], inc_y: usize) -> f32;

    /// `y += α·x` over `x.len()` elements.
    fn axpy(&self, alpha: f32, x: &[f32], y: &mut [f32]);

    /// `x *= α`
    fn scal(&self, alpha: f32, x: &mut [f32]);

    /// Sum of absolute values.
    fn asum(&self, x: &[f32]) -> f32;
}

/// Plain-loop reference implementation.
///
/// Always available, deterministic, and the default backend for networks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveBlas;

impl Blas for NaiveBlas {
    fn gemm(
        &self,
        trans_a: Transpose,
        trans_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[f32],
        b: &[f32],
        beta: f32,
        c: &mut [f32],
    ) {
        let c = &mut c[..m * n];
        if beta == 0.0 {
            c.fill(0.0);
        } else if beta != 1.0 {
            for value in c.iter_mut() {
                *value *= beta;
            }
        }
        if alpha == 0.0 {
            return;
        }

        for i in 0..m {
            for p in 0..k {
                let a_ip = match trans_a {
                    Transpose::No => a[i * k + p],
                    Transpose::Yes => a[p * m + i],
                };
                if a_ip == 0.0 {
                    continue;
                }
                let scaled = alpha * a_ip;
                let row = &mut c[i * n..(i + 1) * n];
                match trans_b {
                    Transpose::No => {
                        for (value, &b_pj) in row.iter_mut().zip(&b[p * n..(p + 1) * n]) {
                            *value += scaled * b_pj;
                        }
                    }
                    Transpose::Yes => {
                        for (j, value) in row.iter_mut().enumerate() {
                            *value += scaled * b[j * k + p];
                        }
                    }
                }
            }
        }
    }

    fn gemv(
        &self,
        trans_a: Transpose,
        m: usize,
        n: usize,
        alpha: f32,
        a: &[f32],
        x: &[f32],
        beta: f32,
        y: &mut [f32],
    ) {
        let out_len = match trans_a {
            Transpose::No => m,
            Transpose::Yes => n,
        };
        let y = &mut y[..out_len];
        if beta == 0.0 {
            y.fill(0.0);
        } else if beta != 1.0 {
            for value in y.iter_mut() {
                *value *= beta;
            }
        }

        match trans_a {
            Transpose::No => {
                for (i, value) in y.iter_mut().enumerate() {
                    let row = &a[i * n..(i + 1) * n];
                    let sum: f32 = row.iter().zip(&x[..n]).map(|(a, x)| a * x).sum();
                    *value += alpha * sum;
                }
            }
            Transpose::Yes => {
                for (i, &x_i) in x[..m].iter().enumerate() {
                    let scaled = alpha * x_i;
                    for (value, &a_ij) in y.iter_mut().zip(&a[i * n..(i + 1) * n]) {
                        *value += scaled * a_ij;
                    }
                }
            }
        }
    }

    fn dot(&self, n: usize, x: &[f32], inc_x: usize, y: &[f32], inc_y: usize) -> f32 {
        (0..n).map(|i| x[i * inc_x] * y[i * inc_y]).sum()
    }

    fn axpy(&self, alpha: f32, x: &[f32], y: &mut [f32]) {
        for (y, &x) in y.iter_mut().zip(x) {
            *y += alpha * x;
        }
    }

    fn scal(&self, alpha: f32, x: &mut [f32]) {
        for value in x.iter_mut() {
            *value *= alpha;
        }
    }

    fn asum(&self, x: &[f32]) -> f32 {
        x.iter().map(|v| v.abs()).sum()
    }
}

#[cfg(feature = "blas")]
pub use self::cblas_backend::CBlas;

#[cfg(feature = "blas")]
mod cblas_backend {
    extern crate blas_src;

    use super::{Blas, Transpose};
    use cblas::{sasum, saxpy, sdot, sgemm, sgemv, sscal, Layout};

    fn to_cblas(trans: Transpose) -> cblas::Transpose {
        match trans {
            Transpose::No => cblas::Transpose::None,
            Transpose::Yes => cblas::Transpose::Ordinary,
        }
    }

    /// Backend forwarding to the system CBLAS.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct CBlas;

    impl Blas for CBlas {
        fn gemm(
            &self,
            trans_a: Transpose,
            trans_b: Transpose,
            m: usize,
            n: usize,
            k: usize,
            alpha: f32,
            a: &[f32],
            b: &[f32],
            beta: f32,
            c: &mut [f32],
        ) {
            let lda = if trans_a == Transpose::No { k } else { m };
            let ldb = if trans_b == Transpose::No { n } else { k };
            unsafe {
                sgemm(
                    Layout::RowMajor,
                    to_cblas(trans_a),
                    to_cblas(trans_b),
                    m as i32,
                    n as i32,
                    k as i32,
                    alpha,
                    a,
                    lda as i32,
                    b,
                    ldb as i32,
                    beta,
                    c,
                    n as i32,
                );
            }
        }

        fn gemv(
            &self,
            trans_a: Transpose,
            m: usize,
            n: usize,
            alpha: f32,
            a: &[f32],
            x: &[f32],
            beta: f32,
            y: &mut [f32],
        ) {
            unsafe {
                sgemv(
                    Layout::RowMajor,
                    to_cblas(trans_a),
                    m as i32,
                    n as i32,
                    alpha,
                    a,
                    n as i32,
                    x,
                    1,
                    beta,
                    y,
                    1,
                );
            }
        }

        fn dot(&self, n: usize, x: &[f32], inc_x: usize, y: &[f32], inc_y: usize) -> f32 {
            unsafe { sdot(n as i32, x, inc_x as i32, y, inc_y as i32) }
        }

        fn axpy(&self, alpha: f32, x: &[f32], y: &mut [f32]) {
            unsafe { saxpy(x.len() as i32, alpha, x, 1, y, 1) }
        }

        fn scal(&self, alpha: f32, x: &mut [f32]) {
            unsafe { sscal(x.len() as i32, alpha, x, 1) }
        }

        fn asum(&self, x: &[f32]) -> f32 {
            unsafe { sasum(x.len() as i32, x, 1) }
        }
    }
}

/// Slice of the `index`-th block of `size` elements.
pub fn block(data: &[f32], index: usize, size: usize) -> &[f32] {
    &data[index * size..(index + 1) * size]
}

/// Mutable slice of the `index`-th block of `size` elements.
pub fn block_mut(data: &mut [f32], index: usize, size: usize) -> &mut [f32] {
    &mut data[index * size..(index + 1) * size]
}
