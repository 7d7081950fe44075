//! Bad-path reconstruction for merge failures
//!
//! Walks the control-flow graph backwards from the instructions that arrive
//! at a failing merge point and collects distinct acyclic paths that start at
//! an entry point (index 0 or a handler start).

use crate::cfg::Cfg;
use crate::error::{BadPath, PathStep};
use crate::program::Entry;

/// Collect up to `max` paths ending at any of `arrivals`. With no arrivals
/// the failure point is an entry point itself and the single path is empty.
pub fn bad_paths(entries: &[Entry], cfg: &Cfg, arrivals: &[usize], max: usize) -> Vec<BadPath> {
    let mut paths = Vec::new();
    if max == 0 {
        return paths;
    }
    if arrivals.is_empty() {
        paths.push(BadPath::default());
        return paths;
    }

    let mut on_path = vec![false; entries.len()];
    for &arrival in arrivals {
        if paths.len() >= max {
            break;
        }
        if cfg.is_root(arrival) {
            paths.push(path(entries, [arrival]));
            continue;
        }

        // Frames hold a node and the next predecessor to try.
        let mut frames: Vec<(usize, usize)> = vec![(arrival, 0)];
        on_path[arrival] = true;
        while let Some(&(node, next)) = frames.last() {
            if paths.len() >= max {
                break;
            }
            let preds = cfg.predecessors(node);
            if next >= preds.len() {
                on_path[node] = false;
                frames.pop();
                continue;
            }
            if let Some(frame) = frames.last_mut() {
                frame.1 += 1;
            }

            let pred = preds[next];
            if on_path[pred] {
                continue;
            }
            if cfg.is_root(pred) {
                let nodes = std::iter::once(pred).chain(frames.iter().rev().map(|&(n, _)| n));
                paths.push(path(entries, nodes));
            } else {
                on_path[pred] = true;
                frames.push((pred, 0));
            }
        }
        for &(node, _) in &frames {
            on_path[node] = false;
        }
    }
    paths
}

fn path(entries: &[Entry], nodes: impl IntoIterator<Item = usize>) -> BadPath {
    BadPath {
        steps: nodes
            .into_iter()
            .map(|index| {
                let entry = &entries[index];
                PathStep {
                    index,
                    instruction: entry.instruction.to_string(),
                    stack_after: Some(entry.stack_after.clone()),
                }
            })
            .collect(),
    }
}
