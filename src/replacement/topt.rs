use super::{BuildContext, Error, ReplacementPolicy};
use crate::cache::AccessDescriptor;
use crate::translate::Translator;
use crate::{address, LOG2_PAGE_SIZE, PAGE_SIZE};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Deserialize)]
struct Knobs {
    graph_data_directory: std::path::PathBuf,
}

/// Belady-style replacement over irregular-array ("graph") data, driven by
/// an offline `.topttrace` oracle of future vertex accesses.
///
/// Victim choice: invalid ways first, then any line holding non-graph data,
/// then the graph line whose next use lies farthest in the vertex trace;
/// lines with no future use fall back to a random pick among themselves.
pub struct Topt {
    vertices: Vec<Vec<u32>>,
    cursors: Vec<usize>,
    translator: Arc<Mutex<Translator>>,
    irreg_arrays: Vec<Vec<(u64, u64)>>,
    rng: SmallRng,
}

impl Topt {
    pub fn new(
        name: &str,
        _sets: usize,
        _ways: usize,
        knobs: &serde_json::Value,
        ctx: &BuildContext,
    ) -> Result<Self, Error> {
        let knobs: Knobs = serde_json::from_value(knobs.clone()).map_err(|source| Error::Knobs {
            name: name.to_string(),
            source,
        })?;

        let mut vertices = Vec::with_capacity(ctx.traces.len());
        for trace in ctx.traces {
            let sibling = knobs
                .graph_data_directory
                .join(trace_model::topt::sibling_name(trace));
            let trace = trace_model::topt::read_vertex_trace(&sibling).map_err(|err| {
                Error::Init {
                    name: name.to_string(),
                    message: format!("cannot load {}: {err}", sibling.display()),
                }
            })?;
            log::info!(
                "loaded {} vertex entries from {}",
                trace.len(),
                sibling.display()
            );
            vertices.push(trace);
        }

        Ok(Self {
            cursors: vec![0; vertices.len()],
            vertices,
            translator: ctx.translator.clone(),
            irreg_arrays: ctx.irreg_arrays.clone(),
            rng: SmallRng::seed_from_u64(0x70b7),
        })
    }

    fn vertex_id(&self, cpu: usize, vaddr: address) -> Option<u64> {
        self.irreg_arrays.get(cpu)?.iter().find_map(|(begin, end)| {
            (vaddr >= *begin && vaddr <= *end).then(|| (vaddr - begin) / 4)
        })
    }

    fn inverse_translate(&self, paddr: address) -> Option<address> {
        let translator = self.translator.lock().unwrap();
        let vpage = translator.inverse_lookup(paddr >> LOG2_PAGE_SIZE)?;
        Some((vpage << LOG2_PAGE_SIZE) | (paddr & (PAGE_SIZE - 1)))
    }

    /// First future use of each candidate line's vertex, measured from the
    /// current position of `vertex` in the trace.
    fn browse_trace(&mut self, cpu: usize, vertex: u64, candidates: &mut [(address, u64)]) {
        let Some(array) = self.irreg_arrays.get(cpu).and_then(|a| a.first()).copied() else {
            return;
        };
        let trace_len = self.vertices.get(cpu).map_or(0, Vec::len);
        if trace_len == 0 {
            return;
        }

        let start = self.cursors[cpu].min(trace_len);
        let origin = {
            let trace = &self.vertices[cpu];
            match trace[start..].iter().position(|&v| u64::from(v) == vertex) {
                Some(at) => start + at,
                None => return,
            }
        };
        self.cursors[cpu] = origin;

        for (distance, &v) in self.vertices[cpu][origin..].iter().enumerate() {
            let vaddr = u64::from(v) * 4 + array.0;
            for (line_vaddr, reuse) in candidates.iter_mut() {
                let line = *line_vaddr & !63;
                if vaddr & !63 == line && *reuse == u64::MAX {
                    *reuse = distance as u64;
                }
            }
            if candidates.iter().all(|(_, reuse)| *reuse != u64::MAX) {
                break;
            }
        }
    }
}

impl ReplacementPolicy for Topt {
    fn name(&self) -> &'static str {
        "topt"
    }

    fn update_state(&mut self, _desc: &AccessDescriptor) {}

    fn find_victim(&mut self, desc: &AccessDescriptor) -> usize {
        if let Some(way) = desc.ways.iter().position(|way| !way.valid) {
            return way;
        }

        let vertex = self
            .inverse_translate(desc.full_addr)
            .and_then(|vaddr| self.vertex_id(desc.cpu, vaddr));
        let Some(vertex) = vertex else {
            // Not graph data; nothing to be clever about.
            return self.rng.gen_range(0..desc.ways.len());
        };

        let mut candidates: Vec<(address, u64)> = Vec::with_capacity(desc.ways.len());
        for way in desc.ways {
            match self.inverse_translate(way.full_addr) {
                Some(vaddr) if self.vertex_id(desc.cpu, vaddr).is_some() => {
                    candidates.push((vaddr, u64::MAX));
                }
                // A line of streaming data gets evicted straight away.
                _ => return candidates.len(),
            }
        }

        self.browse_trace(desc.cpu, vertex, &mut candidates);

        let unseen: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, (_, reuse))| *reuse == u64::MAX)
            .map(|(way, _)| way)
            .collect();
        match unseen.len() {
            0 => candidates
                .iter()
                .enumerate()
                .max_by_key(|(_, (_, reuse))| *reuse)
                .map(|(way, _)| way)
                .unwrap(),
            n if n == candidates.len() => self.rng.gen_range(0..candidates.len()),
            _ => unseen[self.rng.gen_range(0..unseen.len())],
        }
    }
}
