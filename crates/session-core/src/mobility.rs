//! Mobility engine (C6): waypoint script parsing and the timed step
//! loop that updates node positions and triggers reachability
//! recomputation, grounded on the teacher's `Scheduler` tick-task style
//! in `runtime.rs` (one tokio task per session, sleeping between steps).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tracing::debug;

use crate::ids::NodeId;
use crate::node::Position;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Waypoint {
    pub time_offset_ms: u64,
    pub position: Position,
}

#[derive(Clone, Debug, Default)]
pub struct MobilityScript {
    /// Sorted ascending by `time_offset_ms`.
    pub waypoints: Vec<Waypoint>,
    pub loop_enabled: bool,
    pub refresh_ms: u64,
}

impl MobilityScript {
    pub fn duration_ms(&self) -> u64 {
        self.waypoints.last().map(|w| w.time_offset_ms).unwrap_or(0)
    }

    /// Linear interpolation between the bracketing waypoints for `t`
    /// (spec §4.6). Returns `None` before the first waypoint or after
    /// the last when the script isn't looping.
    pub fn position_at(&self, t_ms: u64) -> Option<Position> {
        if self.waypoints.is_empty() {
            return None;
        }
        let t = if self.loop_enabled && self.duration_ms() > 0 {
            t_ms % self.duration_ms()
        } else {
            t_ms
        };

        if t <= self.waypoints[0].time_offset_ms {
            return Some(self.waypoints[0].position);
        }
        let last = self.waypoints.last().unwrap();
        if t >= last.time_offset_ms {
            return if self.loop_enabled { Some(self.waypoints[0].position) } else { Some(last.position) };
        }

        for pair in self.waypoints.windows(2) {
            let (w0, w1) = (pair[0], pair[1]);
            if t >= w0.time_offset_ms && t <= w1.time_offset_ms {
                let span = (w1.time_offset_ms - w0.time_offset_ms) as f64;
                let frac = if span == 0.0 { 0.0 } else { (t - w0.time_offset_ms) as f64 / span };
                return Some(Position {
                    x: w0.position.x + (w1.position.x - w0.position.x) * frac,
                    y: w0.position.y + (w1.position.y - w0.position.y) * frac,
                    z: w0.position.z + (w1.position.z - w0.position.z) * frac,
                });
            }
        }
        Some(last.position)
    }
}

/// Parse a simple line-oriented waypoint script:
/// `<time_ms> <node_id> <x> <y> <z>`, with optional header lines
/// `loop=true` / `refresh_ms=50`. Unrecognized lines and blank lines are
/// skipped.
pub fn parse_script(text: &str) -> HashMap<NodeId, MobilityScript> {
    let mut loop_enabled = false;
    let mut refresh_ms = 50u64;
    let mut per_node: HashMap<NodeId, Vec<Waypoint>> = HashMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(value) = line.strip_prefix("loop=") {
            loop_enabled = value.trim() == "true";
            continue;
        }
        if let Some(value) = line.strip_prefix("refresh_ms=") {
            if let Ok(v) = value.trim().parse() {
                refresh_ms = v;
            }
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let (Ok(t), Ok(node), Ok(x), Ok(y)) = (
            fields[0].parse::<u64>(),
            fields[1].parse::<u32>(),
            fields[2].parse::<f64>(),
            fields[3].parse::<f64>(),
        ) else {
            continue;
        };
        let z = fields.get(4).and_then(|v| v.parse().ok()).unwrap_or(0.0);

        per_node.entry(NodeId(node)).or_default().push(Waypoint {
            time_offset_ms: t,
            position: Position { x, y, z },
        });
    }

    per_node
        .into_iter()
        .map(|(node, mut waypoints)| {
            waypoints.sort_by_key(|w| w.time_offset_ms);
            (
                node,
                MobilityScript {
                    waypoints,
                    loop_enabled,
                    refresh_ms,
                },
            )
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MobilityControl {
    Start,
    Stop,
    Pause,
}

/// One tick's worth of position updates, handed back to the session
/// thread so it can update the node table and trigger reachability
/// recomputation (C4).
#[derive(Debug, Clone)]
pub struct MobilityTick {
    pub updates: Vec<(NodeId, Position)>,
}

struct EngineState {
    scripts: HashMap<NodeId, MobilityScript>,
    elapsed_ms: u64,
    running: bool,
}

/// Mobility engine tick driver. A single tokio task advances `elapsed_ms`
/// on a `refresh_ms`-period interval and publishes a `MobilityTick`
/// through an mpsc channel for the session thread to apply.
pub struct MobilityEngine {
    state: Arc<Mutex<EngineState>>,
    tick_tx: mpsc::Sender<MobilityTick>,
    default_refresh_ms: u64,
}

impl MobilityEngine {
    pub fn new(default_refresh_ms: u64) -> (Self, mpsc::Receiver<MobilityTick>) {
        let (tick_tx, tick_rx) = mpsc::channel(64);
        let engine = Self {
            state: Arc::new(Mutex::new(EngineState {
                scripts: HashMap::new(),
                elapsed_ms: 0,
                running: false,
            })),
            tick_tx,
            default_refresh_ms,
        };
        (engine, tick_rx)
    }

    /// Loading a new script suspends mobility until the load completes
    /// (open question (b) in spec §9), which this satisfies trivially:
    /// the whole operation runs under the state mutex that the tick loop
    /// also holds while computing a step.
    pub async fn load_script(&self, node: NodeId, script: MobilityScript) {
        let mut state = self.state.lock().await;
        state.scripts.insert(node, script);
    }

    pub async fn control(&self, signal: MobilityControl) {
        let mut state = self.state.lock().await;
        match signal {
            MobilityControl::Start => state.running = true,
            MobilityControl::Stop => {
                state.running = false;
                state.elapsed_ms = 0;
            }
            MobilityControl::Pause => state.running = false,
        }
    }

    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        let tick_tx = self.tick_tx.clone();
        let refresh_ms = self.default_refresh_ms.max(1);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(refresh_ms));
            loop {
                ticker.tick().await;
                let mut state = state.lock().await;
                if !state.running {
                    continue;
                }
                state.elapsed_ms += refresh_ms;
                let elapsed = state.elapsed_ms;
                let mut updates = Vec::new();
                for (node, script) in &state.scripts {
                    if let Some(pos) = script.position_at(elapsed) {
                        updates.push((*node, pos));
                    }
                }
                drop(state);
                if !updates.is_empty() {
                    debug!("mobility tick at {}ms: {} node(s) updated", elapsed, updates.len());
                    if tick_tx.send(MobilityTick { updates }).await.is_err() {
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wp(t: u64, x: f64) -> Waypoint {
        Waypoint {
            time_offset_ms: t,
            position: Position { x, y: 0.0, z: 0.0 },
        }
    }

    #[test]
    fn interpolates_linearly_between_waypoints() {
        let script = MobilityScript {
            waypoints: vec![wp(0, 0.0), wp(1000, 100.0)],
            loop_enabled: false,
            refresh_ms: 50,
        };
        let pos = script.position_at(500).unwrap();
        assert!((pos.x - 50.0).abs() < 1e-9);
    }

    #[test]
    fn clamps_before_first_and_after_last_when_not_looping() {
        let script = MobilityScript {
            waypoints: vec![wp(100, 10.0), wp(200, 20.0)],
            loop_enabled: false,
            refresh_ms: 50,
        };
        assert_eq!(script.position_at(0).unwrap().x, 10.0);
        assert_eq!(script.position_at(1000).unwrap().x, 20.0);
    }

    #[test]
    fn loop_rewinds_at_end() {
        let script = MobilityScript {
            waypoints: vec![wp(0, 0.0), wp(1000, 100.0)],
            loop_enabled: true,
            refresh_ms: 50,
        };
        let pos = script.position_at(1000).unwrap();
        assert_eq!(pos.x, 0.0);
    }

    #[test]
    fn parses_script_with_header_and_waypoints() {
        let text = "loop=true\nrefresh_ms=100\n0 1 0.0 0.0 0.0\n1000 1 200.0 0.0 0.0\n";
        let scripts = parse_script(text);
        let script = scripts.get(&NodeId(1)).unwrap();
        assert!(script.loop_enabled);
        assert_eq!(script.refresh_ms, 100);
        assert_eq!(script.waypoints.len(), 2);
    }
}
