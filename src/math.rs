use faer::{
    linalg::{
        solvers::{DenseSolveCore, Llt, LltError},
        triangular_solve::solve_lower_triangular_in_place,
    },
    ColMut, ColRef, Mat, MatRef, Par, Side,
};
use itertools::izip;
use multiversion::multiversion;

use crate::error::NumericalError;

fn check_square(a: &Mat<f64>) -> Result<usize, NumericalError> {
    if a.nrows() != a.ncols() {
        return Err(NumericalError::DimensionMismatch {
            expected: a.nrows(),
            found: a.ncols(),
        });
    }
    Ok(a.nrows())
}

/// `L Lᵀ` factorisation of a symmetric positive definite matrix.
///
/// Only the lower triangle of `a` is read.
pub(crate) fn cholesky(a: &Mat<f64>) -> Result<Llt<f64>, NumericalError> {
    check_square(a)?;
    if !all_finite(a) {
        return Err(NumericalError::NonFinite("matrix to factorise"));
    }
    a.llt(Side::Lower).map_err(|err| match err {
        LltError::NonPositivePivot { index } => NumericalError::NotPositiveDefinite { pivot: index },
    })
}

/// Solve `L x = b` for lower triangular `L`.
pub(crate) fn solve_lower(lower: MatRef<'_, f64>, b: &[f64]) -> Result<Vec<f64>, NumericalError> {
    if b.len() != lower.nrows() {
        return Err(NumericalError::DimensionMismatch {
            expected: lower.nrows(),
            found: b.len(),
        });
    }
    let mut x = b.to_vec();
    solve_lower_triangular_in_place(lower, ColMut::from_slice_mut(&mut x).as_mat_mut(), Par::Seq);
    Ok(x)
}

/// Inverse of a symmetric positive definite matrix.
pub(crate) fn spd_inverse(a: &Mat<f64>) -> Result<Mat<f64>, NumericalError> {
    let inverse = cholesky(a)?.inverse();
    if !all_finite(&inverse) {
        return Err(NumericalError::NonFinite("matrix inverse"));
    }
    Ok(inverse)
}

pub(crate) fn log_det(llt: &Llt<f64>) -> f64 {
    2f64 * llt.L().diagonal().column_vector().iter().map(|d| d.ln()).sum::<f64>()
}

pub(crate) fn mat_vec(a: MatRef<'_, f64>, x: &[f64]) -> Result<Vec<f64>, NumericalError> {
    if a.ncols() != x.len() {
        return Err(NumericalError::DimensionMismatch {
            expected: a.ncols(),
            found: x.len(),
        });
    }
    let y = a * ColRef::from_slice(x);
    Ok(y.iter().copied().collect())
}

pub(crate) fn add_mat(a: &Mat<f64>, b: &Mat<f64>) -> Result<Mat<f64>, NumericalError> {
    if a.nrows() != b.nrows() || a.ncols() != b.ncols() {
        return Err(NumericalError::DimensionMismatch {
            expected: a.nrows(),
            found: b.nrows(),
        });
    }
    Ok(a + b)
}

pub(crate) fn all_finite(a: &Mat<f64>) -> bool {
    let mut ok = true;
    faer::zip!(a).for_each(|faer::unzip!(val)| ok &= val.is_finite());
    ok
}

pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(x.len() == y.len());
    izip!(x, y).for_each(|(x, y)| *y = a.mul_add(*x, *y));
}

/// Elementwise `dest += source` over histogram count arrays.
#[multiversion(targets("x86_64+avx+avx2", "x86+sse"))]
pub(crate) fn add_counts(dest: &mut [u64], source: &[u64]) {
    assert!(dest.len() == source.len());
    izip!(dest, source).for_each(|(d, s)| *d += s);
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use faer::{mat, Mat};

    use super::*;

    fn example() -> Mat<f64> {
        mat![[4., 2., 0.6], [2., 5., 1.], [0.6, 1., 3.]]
    }

    #[test]
    fn cholesky_reconstructs() {
        let a = example();
        let llt = cholesky(&a).unwrap();
        let rebuilt = llt.L() * llt.L().transpose();
        faer::zip!(&rebuilt, &a).for_each(|faer::unzip!(r, a)| {
            assert_relative_eq!(*r, *a, epsilon = 1e-12);
        });
    }

    #[test]
    fn inverse_is_inverse() {
        let a = example();
        let product = &a * spd_inverse(&a).unwrap();
        let identity = Mat::<f64>::identity(3, 3);
        faer::zip!(&product, &identity).for_each(|faer::unzip!(p, i)| {
            assert_relative_eq!(*p, *i, epsilon = 1e-12);
        });
    }

    #[test]
    fn indefinite_is_rejected() {
        let mut a = example();
        a[(2, 2)] = -1.;
        match cholesky(&a) {
            Err(NumericalError::NotPositiveDefinite { pivot }) => assert_eq!(pivot, 2),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        a[(2, 2)] = f64::NAN;
        assert!(matches!(cholesky(&a), Err(NumericalError::NonFinite(_))));
    }

    #[test]
    fn log_det_matches_product() {
        let a = mat![[2., 0.], [0., 8.]];
        assert_relative_eq!(log_det(&cholesky(&a).unwrap()), 16f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn triangular_solve_inverts_product() {
        let llt = cholesky(&example()).unwrap();
        let x = [1., -2., 0.5];
        let b = mat_vec(llt.L(), &x).unwrap();
        let solved = solve_lower(llt.L(), &b).unwrap();
        for (s, x) in solved.iter().zip(&x) {
            assert_relative_eq!(*s, *x, epsilon = 1e-12);
        }
    }

    #[test]
    fn shapes_are_checked() {
        let a = example();
        assert_eq!(
            mat_vec(a.as_ref(), &[1., 2.]),
            Err(NumericalError::DimensionMismatch {
                expected: 3,
                found: 2
            })
        );
        assert!(add_mat(&a, &Mat::zeros(2, 2)).is_err());
        assert!(solve_lower(a.as_ref(), &[1.]).is_err());
    }

    #[test]
    fn counts_add() {
        let mut a = vec![1, 2, 3];
        add_counts(&mut a, &[3, 2, 1]);
        assert_eq!(a, vec![4, 4, 4]);
    }
}
