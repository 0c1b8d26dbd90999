//! Test and helper mocks for dmf_core.
//!
//! `ScriptedBoard` plays back queued per-measurement window scripts and
//! records every command it receives, so tests can drive the step runner
//! without hardware and assert on the exact traffic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dmf_traits::{BoxError, MeasurementRequest, RawWindow, Transport};

/// Everything a `ScriptedBoard` was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardCommand {
    SetVoltage(f64),
    SetFrequency(f64),
    SetChannels(Vec<u8>),
    Measure(MeasurementRequest),
    Watchdog,
    SyncCalibration,
}

/// One scripted reply to a measurement command.
#[derive(Debug, Clone)]
enum Script {
    /// Explicit windows; truncated or last-padded to the requested count.
    Windows(Vec<RawWindow>),
    /// One window repeated to the requested count.
    Uniform(RawWindow),
}

/// A transport that replays scripted measurements. When scripts run out the
/// last one repeats, mirroring a steady-state device.
pub struct ScriptedBoard {
    scripts: VecDeque<Script>,
    last: Option<Script>,
    pending: Option<Vec<RawWindow>>,
    channels: usize,
    buffer_size: usize,
    commands: Arc<Mutex<Vec<BoardCommand>>>,
}

impl ScriptedBoard {
    pub fn new(channels: usize, buffer_size: usize) -> Self {
        Self {
            scripts: VecDeque::new(),
            last: None,
            pending: None,
            channels,
            buffer_size,
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue an explicit window script for the next measurement.
    pub fn push_windows(&mut self, windows: Vec<RawWindow>) {
        self.scripts.push_back(Script::Windows(windows));
    }

    /// Queue a measurement whose windows all read the same amplitudes on
    /// bank `bank`.
    pub fn push_uniform(&mut self, v_hv: f64, v_fb: f64, bank: i8) {
        self.scripts.push_back(Script::Uniform(RawWindow {
            v_hv,
            v_fb,
            hv_resistor: bank,
            fb_resistor: bank,
        }));
    }

    /// Shared handle to the recorded command log.
    pub fn commands(&self) -> Arc<Mutex<Vec<BoardCommand>>> {
        self.commands.clone()
    }

    fn record(&self, cmd: BoardCommand) {
        if let Ok(mut log) = self.commands.lock() {
            log.push(cmd);
        }
    }

    fn render(&mut self, req: &MeasurementRequest) -> Vec<RawWindow> {
        let script = match self.scripts.pop_front() {
            Some(s) => {
                self.last = Some(s.clone());
                s
            }
            None => self.last.clone().unwrap_or(Script::Uniform(RawWindow {
                v_hv: 0.0,
                v_fb: 0.0,
                hv_resistor: -1,
                fb_resistor: -1,
            })),
        };
        let n = req.n_sampling_windows as usize;
        match script {
            Script::Uniform(w) => vec![w; n],
            Script::Windows(mut ws) => {
                let pad = ws.last().copied().unwrap_or(RawWindow {
                    v_hv: 0.0,
                    v_fb: 0.0,
                    hv_resistor: -1,
                    fb_resistor: -1,
                });
                ws.resize(n, pad);
                ws
            }
        }
    }
}

impl Transport for ScriptedBoard {
    fn measure(&mut self, req: &MeasurementRequest) -> Result<Vec<RawWindow>, BoxError> {
        self.record(BoardCommand::Measure(req.clone()));
        Ok(self.render(req))
    }

    fn start_measurement(&mut self, req: &MeasurementRequest) -> Result<(), BoxError> {
        self.record(BoardCommand::Measure(req.clone()));
        self.pending = Some(self.render(req));
        Ok(())
    }

    fn take_measurement(&mut self) -> Result<Vec<RawWindow>, BoxError> {
        self.pending
            .take()
            .ok_or_else(|| "no measurement in flight".into())
    }

    fn set_waveform_voltage(&mut self, vrms: f64) -> Result<(), BoxError> {
        self.record(BoardCommand::SetVoltage(vrms));
        Ok(())
    }

    fn set_waveform_frequency(&mut self, hz: f64) -> Result<(), BoxError> {
        self.record(BoardCommand::SetFrequency(hz));
        Ok(())
    }

    fn set_channel_state(&mut self, state: &[u8]) -> Result<(), BoxError> {
        self.record(BoardCommand::SetChannels(state.to_vec()));
        Ok(())
    }

    fn channel_count(&mut self) -> usize {
        self.channels
    }

    fn command_buffer_size(&mut self) -> usize {
        self.buffer_size
    }

    fn assert_watchdog(&mut self) -> Result<(), BoxError> {
        self.record(BoardCommand::Watchdog);
        Ok(())
    }

    fn sync_calibration(
        &mut self,
        _r_hv: &[f64],
        _c_hv: &[f64],
        _r_fb: &[f64],
        _c_fb: &[f64],
    ) -> Result<(), BoxError> {
        self.record(BoardCommand::SyncCalibration);
        Ok(())
    }
}
