use std::io::Write;

use nalgebra::DVector;

/// The three optional output sinks of a variational inference run.
///
/// `progress` receives human-readable status lines, `samples` receives one
/// comma-separated row per posterior draw (log-density first), and
/// `diagnostics` receives the `iter,time_in_seconds,ELBO` trace. Absent
/// sinks are skipped without cost.
#[derive(Default)]
pub struct OutputWriters<'a> {
    /// Human-readable progress and convergence assessment.
    pub progress: Option<&'a mut dyn Write>,
    /// Posterior parameter draws.
    pub samples: Option<&'a mut dyn Write>,
    /// ELBO trace in CSV form.
    pub diagnostics: Option<&'a mut dyn Write>,
}

impl<'a> OutputWriters<'a> {
    /// All sinks absent.
    pub fn none() -> Self {
        Self::default()
    }

    /// Write `msg` to the progress sink without a trailing newline.
    pub fn progress(&mut self, msg: &str) -> anyhow::Result<()> {
        if let Some(w) = self.progress.as_mut() {
            write!(w, "{msg}")?;
            w.flush()?;
        }
        Ok(())
    }

    /// Write `msg` and a newline to the progress sink.
    pub fn progress_line(&mut self, msg: &str) -> anyhow::Result<()> {
        if let Some(w) = self.progress.as_mut() {
            writeln!(w, "{msg}")?;
        }
        Ok(())
    }

    /// Write the diagnostic CSV header.
    pub fn diagnostic_header(&mut self) -> anyhow::Result<()> {
        if let Some(w) = self.diagnostics.as_mut() {
            writeln!(w, "iter,time_in_seconds,ELBO")?;
        }
        Ok(())
    }

    /// Write one diagnostic CSV row.
    pub fn diagnostic_row(&mut self, iter: usize, seconds: f32, elbo: f32) -> anyhow::Result<()> {
        if let Some(w) = self.diagnostics.as_mut() {
            writeln!(w, "{iter},{seconds},{elbo}")?;
        }
        Ok(())
    }

    /// Write one posterior sample row: log-density, then the parameters.
    pub fn sample_row(&mut self, lp: f32, params: &DVector<f32>) -> anyhow::Result<()> {
        if let Some(w) = self.samples.as_mut() {
            write!(w, "{lp}")?;
            for v in params.iter() {
                write!(w, ",{v}")?;
            }
            writeln!(w)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_sinks_are_noops() {
        let mut writers = OutputWriters::none();
        writers.progress_line("hello").unwrap();
        writers.diagnostic_header().unwrap();
        writers
            .sample_row(-1.0, &DVector::from_vec(vec![1.0, 2.0]))
            .unwrap();
    }

    #[test]
    fn sample_row_is_lp_then_params() {
        let mut buf = Vec::new();
        let mut writers = OutputWriters {
            samples: Some(&mut buf),
            ..OutputWriters::none()
        };
        writers
            .sample_row(-2.5, &DVector::from_vec(vec![1.0, -3.0]))
            .unwrap();
        drop(writers);
        assert_eq!(String::from_utf8(buf).unwrap(), "-2.5,1,-3\n");
    }

    #[test]
    fn diagnostic_trace_has_csv_header() {
        let mut buf = Vec::new();
        let mut writers = OutputWriters {
            diagnostics: Some(&mut buf),
            ..OutputWriters::none()
        };
        writers.diagnostic_header().unwrap();
        writers.diagnostic_row(100, 0.25, -4.5).unwrap();
        drop(writers);
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("iter,time_in_seconds,ELBO"));
        assert_eq!(lines.next(), Some("100,0.25,-4.5"));
    }
}
