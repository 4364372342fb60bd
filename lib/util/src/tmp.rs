//! Temp-file helpers.
//!
//! All scratch files live under the invocation's temp prefix so that one
//! `rm -r` cleans up after a run.

use rand::{distributions::Alphanumeric, Rng};
use std::{
	io::Write,
	path::{Path, PathBuf},
};

/// Generate a fresh file name under `dir` with the given prefix.
/// The file is not created.
pub fn create_filename(dir: &Path, prefix: &str) -> PathBuf {
	let suffix: String = rand::thread_rng()
		.sample_iter(&Alphanumeric)
		.take(10)
		.map(char::from)
		.collect();
	dir.join(format!("{prefix}{suffix}"))
}

/// Create a fresh file under `dir` and write `contents` to it.
pub fn write_tmp_file(dir: &Path, prefix: &str, contents: &str) -> std::io::Result<PathBuf> {
	std::fs::create_dir_all(dir)?;
	let path = create_filename(dir, prefix);
	let mut f = std::fs::File::create(&path)?;
	f.write_all(contents.as_bytes())?;
	return Ok(path);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fresh_names_do_not_collide() {
		let a = create_filename(Path::new("/tmp"), "dish");
		let b = create_filename(Path::new("/tmp"), "dish");
		assert_ne!(a, b);
	}
}
