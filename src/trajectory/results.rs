//! Host-side trajectory result arrays and the console dump

use std::fmt;
use std::io::{self, Write};

use crate::error::{ComputeError, Result};

/// Number of output channels the kernel writes
pub const CHANNEL_COUNT: usize = 5;

/// One of the five kernel outputs, in argument order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrajectoryChannel {
    PositionX,
    PositionY,
    VelocityX,
    VelocityY,
    Speed,
}

impl TrajectoryChannel {
    pub const ALL: [TrajectoryChannel; CHANNEL_COUNT] = [
        TrajectoryChannel::PositionX,
        TrajectoryChannel::PositionY,
        TrajectoryChannel::VelocityX,
        TrajectoryChannel::VelocityY,
        TrajectoryChannel::Speed,
    ];

    /// Buffer and argument index of the channel
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TrajectoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrajectoryChannel::PositionX => "position-x",
            TrajectoryChannel::PositionY => "position-y",
            TrajectoryChannel::VelocityX => "velocity-x",
            TrajectoryChannel::VelocityY => "velocity-y",
            TrajectoryChannel::Speed => "speed",
        };
        write!(f, "{}", name)
    }
}

/// Five arrays of `sample_count` values, zero until a run succeeds
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryResults {
    channels: [Vec<f32>; CHANNEL_COUNT],
    time_delta: f32,
}

impl TrajectoryResults {
    /// Allocates zeroed arrays
    pub fn new(sample_count: usize, time_delta: f32) -> Result<Self> {
        let mut channels: [Vec<f32>; CHANNEL_COUNT] = Default::default();
        for (channel, values) in TrajectoryChannel::ALL.iter().zip(channels.iter_mut()) {
            values.try_reserve_exact(sample_count).map_err(|e| {
                ComputeError::Allocation(format!(
                    "Failed to allocate {} host array of {} samples: {}",
                    channel, sample_count, e
                ))
            })?;
            values.resize(sample_count, 0.0);
        }
        Ok(Self {
            channels,
            time_delta,
        })
    }

    pub fn sample_count(&self) -> usize {
        self.channels[0].len()
    }

    pub fn time_delta(&self) -> f32 {
        self.time_delta
    }

    /// Elapsed time reported for sample `i`
    pub fn time_at(&self, i: usize) -> f32 {
        i as f32 * self.time_delta
    }

    pub fn channel(&self, channel: TrajectoryChannel) -> &[f32] {
        &self.channels[channel.index()]
    }

    pub fn position_x(&self) -> &[f32] {
        self.channel(TrajectoryChannel::PositionX)
    }

    pub fn position_y(&self) -> &[f32] {
        self.channel(TrajectoryChannel::PositionY)
    }

    pub fn velocity_x(&self) -> &[f32] {
        self.channel(TrajectoryChannel::VelocityX)
    }

    pub fn velocity_y(&self) -> &[f32] {
        self.channel(TrajectoryChannel::VelocityY)
    }

    pub fn speed(&self) -> &[f32] {
        self.channel(TrajectoryChannel::Speed)
    }

    /// Copies the leading `sample_count` values of each staged array
    ///
    /// Nothing is written unless every staged array is long enough.
    pub(crate) fn commit(&mut self, staged: &[Vec<f32>]) -> Result<()> {
        let count = self.sample_count();
        if staged.len() != CHANNEL_COUNT || staged.iter().any(|s| s.len() < count) {
            return Err(ComputeError::Transfer(format!(
                "Staged results do not cover {} samples in {} channels",
                count, CHANNEL_COUNT
            )));
        }
        for (values, source) in self.channels.iter_mut().zip(staged) {
            values.copy_from_slice(&source[..count]);
        }
        Ok(())
    }

    /// Writes the `>> BEGIN` ... `>> END` dump, four lines per sample
    pub fn write_log<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, ">> BEGIN")?;
        for i in 0..self.sample_count() {
            writeln!(out, ">>      Time: t = {}", self.time_at(i))?;
            writeln!(
                out,
                "    Position: ( {}, {} )",
                self.position_x()[i],
                self.position_y()[i]
            )?;
            writeln!(
                out,
                "    Velocity: ( {}, {} )",
                self.velocity_x()[i],
                self.velocity_y()[i]
            )?;
            writeln!(out, "       speed: || v(t) || = {}", self.speed()[i])?;
        }
        writeln!(out, ">> END")
    }
}
