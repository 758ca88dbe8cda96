//! Console progress display

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ioio_core::chip::Chip;
use ioio_core::progress::ProgressListener;
use ioio_core::programmer::{ProgrammerState, RunOutcome};
use std::time::Duration;

/// Create a progress bar with block counts and a phase label
fn create_progress_bar_with_phase(
    total: u64,
    phase: &str,
) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} blocks ({{eta}}) {}",
                phase
            ))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn create_spinner_style() -> Result<ProgressStyle, Box<dyn std::error::Error>> {
    Ok(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?)
}

/// Progress reporter using indicatif progress bars
///
/// One spinner for the erase, then one bar per pass.
pub struct IndicatifProgress {
    multi: MultiProgress,
    current_bar: Option<ProgressBar>,
    pass: Option<ProgrammerState>,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            current_bar: None,
            pass: None,
        }
    }

    fn create_bar(&mut self, total: u64, phase: &'static str) {
        let pb = self.multi.add(
            create_progress_bar_with_phase(total, phase)
                .unwrap_or_else(|_| ProgressBar::new(total)),
        );
        self.current_bar = Some(pb);
    }

    fn create_spinner(&mut self, message: &str) {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(create_spinner_style().unwrap_or_else(|_| ProgressStyle::default_spinner()));
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        self.current_bar = Some(pb);
    }

    fn finish(&mut self, message: &str) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish_with_message(message.to_string());
        }
    }

    fn abandon(&mut self) {
        if let Some(pb) = self.current_bar.take() {
            pb.abandon();
        }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressListener for IndicatifProgress {
    fn state_changed(&mut self, state: ProgrammerState, _target: Option<Chip>) {
        match state {
            ProgrammerState::EraseInProgress => self.create_spinner("Erasing..."),
            ProgrammerState::ProgramInProgress => self.finish("Erase complete"),
            ProgrammerState::VerifyInProgress => self.finish("Write complete"),
            ProgrammerState::IoioDisconnected => self.abandon(),
            _ => {}
        }
    }

    fn block_done(&mut self, pass: ProgrammerState, done: usize, total: usize) {
        if self.pass != Some(pass) || self.current_bar.is_none() {
            let phase = match pass {
                ProgrammerState::VerifyInProgress => "Verifying",
                _ => "Writing",
            };
            self.pass = Some(pass);
            self.create_bar(total as u64, phase);
        }
        if let Some(pb) = &self.current_bar {
            pb.set_position(done as u64);
        }
    }

    fn run_finished(&mut self, outcome: &RunOutcome) {
        self.pass = None;
        match outcome {
            RunOutcome::Success => self.finish("Done"),
            _ => self.abandon(),
        }
        println!("Result: {}", outcome);
    }
}
