// Discrete Fourier transforms used by the inverse variants

use crate::error::{XcError, XcResult};
use rustfft::{num_complex::Complex, FftPlanner};
use std::cell::RefCell;

// Thread-local FFT planner reused across the reduction pool
thread_local! {
    static FFT_PLANNER: RefCell<FftPlanner<f64>> = RefCell::new(FftPlanner::new());
}

/// Real/complex DFT capability.
///
/// Both directions are unnormalized; `inverse(forward(x), n)` yields `n * x`.
pub trait Transform: Send + Sync {
    /// Real input to its `n / 2 + 1` non-negative frequency bins
    fn forward(&self, input: &[f64]) -> XcResult<Vec<Complex<f64>>>;

    /// Hermitian spectrum to `len` real samples; reads the first `len / 2 + 1` bins
    fn inverse(&self, spectrum: &[Complex<f64>], len: usize) -> XcResult<Vec<f64>>;
}

/// `Transform` backed by rustfft
#[derive(Debug, Default, Clone, Copy)]
pub struct RustFftTransform;

impl Transform for RustFftTransform {
    fn forward(&self, input: &[f64]) -> XcResult<Vec<Complex<f64>>> {
        let n = input.len();
        if n == 0 {
            return Err(XcError::Transform("empty input".to_string()));
        }
        let mut buffer: Vec<Complex<f64>> = input.iter().map(|&x| Complex::new(x, 0.0)).collect();

        FFT_PLANNER.with(|planner| {
            let fft = planner.borrow_mut().plan_fft_forward(n);
            fft.process(&mut buffer);
        });

        buffer.truncate(n / 2 + 1);
        Ok(buffer)
    }

    fn inverse(&self, spectrum: &[Complex<f64>], len: usize) -> XcResult<Vec<f64>> {
        if len == 0 {
            return Err(XcError::Transform("empty output length".to_string()));
        }
        let half = len / 2;
        if spectrum.len() < half + 1 {
            return Err(XcError::Transform(format!(
                "{} bins cannot describe {} samples",
                spectrum.len(),
                len
            )));
        }

        let mut buffer = vec![Complex::new(0.0, 0.0); len];
        buffer[..=half].copy_from_slice(&spectrum[..=half]);
        for k in half + 1..len {
            buffer[k] = spectrum[len - k].conj();
        }
        // Imaginary parts of the self-conjugate bins cannot survive a real output
        buffer[0].im = 0.0;
        if len % 2 == 0 {
            buffer[half].im = 0.0;
        }

        FFT_PLANNER.with(|planner| {
            let fft = planner.borrow_mut().plan_fft_inverse(len);
            fft.process(&mut buffer);
        });

        let output: Vec<f64> = buffer.iter().map(|c| c.re).collect();
        if output.iter().any(|v| !v.is_finite()) {
            return Err(XcError::Transform("non-finite output".to_string()));
        }
        Ok(output)
    }
}

/// Swap the first and second halves in place (zero-frequency centering).
///
/// Element `i` trades places with `i + n / 2` for `i < n / 2`, so applying it
/// twice restores the input for any length.
pub fn swap_halves<T>(data: &mut [T]) {
    let half = data.len() / 2;
    for i in 0..half {
        data.swap(i, i + half);
    }
}
