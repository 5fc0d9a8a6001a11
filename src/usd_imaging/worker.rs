use super::index_proxy::Bookkeeping;
use super::{PrimAdapter, QueryContext, Result, ValueCache};
use crate::hd::DirtyBits;
use crate::{sdf, usd};
use rayon::prelude::*;
use std::sync::Arc;

struct Task {
	cache_path: sdf::Path,
	usd_path: sdf::Path,
	adapter: Arc<dyn PrimAdapter>,
	requested: DirtyBits,
}

/// Fixed-size pool running the variability and update passes.
///
/// Each pass partitions its work by cache path; tasks never depend on each
/// other and results are written back on the calling thread after the join.
pub struct Worker {
	pool: rayon::ThreadPool,
}

impl Worker {
	/// Build a pool of `num_threads` workers, or one per core if `None`.
	pub fn new(num_threads: Option<usize>) -> Result<Self> {
		let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|index| format!("usd-imaging-{index}"));
		if let Some(num) = num_threads {
			builder = builder.num_threads(num);
		}
		let pool = builder.build()?;
		Ok(Self { pool })
	}

	pub fn num_threads(&self) -> usize {
		self.pool.current_num_threads()
	}

	/// Track variability for every requested cache path. Returns the number
	/// of paths processed.
	pub(crate) fn run_variability(&self, stage: &usd::Stage, book: &mut Bookkeeping, query: QueryContext) -> usize {
		let requests = std::mem::take(&mut book.variability_requests);
		let tasks: Vec<Task> = requests
			.into_iter()
			.filter_map(|cache_path| {
				let info = book.prim_info.get(&cache_path)?;
				Some(Task {
					usd_path: info.usd_path.clone(),
					adapter: info.adapter.clone(),
					requested: DirtyBits::CLEAN,
					cache_path,
				})
			})
			.collect();
		if tasks.is_empty() {
			return 0;
		}

		log::debug!(target: "usd_imaging::changes", "Tracking variability of {} prims", tasks.len());
		book.time_varying = None;

		let results: Vec<DirtyBits> = self.pool.install(|| {
			tasks
				.par_iter()
				.map(|task| {
					let mut bits = DirtyBits::CLEAN;
					match stage.prim_at_path(&task.usd_path) {
						Some(prim) => task.adapter.track_variability(&prim, &task.cache_path, &query, &mut bits),
						None => log::debug!("Skipping variability of <{}>: prim is gone", task.cache_path),
					}
					bits
				})
				.collect()
		});

		for (task, bits) in tasks.iter().zip(results) {
			if let Some(info) = book.prim_info.get_mut(&task.cache_path) {
				info.time_varying_bits = bits;
			}
		}
		tasks.len()
	}

	/// Pull values at `query.time` for every dirty or explicitly requested
	/// cache path, then mark them clean. Returns the number of paths updated.
	pub(crate) fn run_update(
		&self,
		stage: &usd::Stage,
		book: &mut Bookkeeping,
		query: QueryContext,
		cache: &ValueCache,
	) -> usize {
		let requests = std::mem::take(&mut book.update_requests);
		let mut tasks: Vec<Task> = book
			.prim_info
			.iter()
			.filter(|(cache_path, info)| !info.dirty_bits.is_clean() || requests.contains(*cache_path))
			.map(|(cache_path, info)| Task {
				cache_path: cache_path.clone(),
				usd_path: info.usd_path.clone(),
				adapter: info.adapter.clone(),
				requested: if info.dirty_bits.is_clean() {
					DirtyBits::ALL_DIRTY
				} else {
					info.dirty_bits
				},
			})
			.collect();
		tasks.sort_by(|a, b| a.cache_path.cmp(&b.cache_path));
		if tasks.is_empty() {
			return 0;
		}

		log::debug!(target: "usd_imaging::changes", "Updating {} prims", tasks.len());

		self.pool.install(|| {
			tasks.par_iter().for_each(|task| match stage.prim_at_path(&task.usd_path) {
				Some(prim) => task
					.adapter
					.update_for_time(&prim, &task.cache_path, &query, task.requested, cache),
				None => log::debug!("Skipping update of <{}>: prim is gone", task.cache_path),
			});
		});

		for task in &tasks {
			if let Some(info) = book.prim_info.get_mut(&task.cache_path) {
				info.dirty_bits = DirtyBits::CLEAN;
			}
		}
		tasks.len()
	}
}

impl std::fmt::Debug for Worker {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("Worker")
			.field("num_threads", &self.num_threads())
			.finish()
	}
}
