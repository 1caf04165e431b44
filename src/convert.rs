//! `.npy` to `.mat` conversion

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::error::TrajError;
use crate::mat::write_mat;
use crate::npy::{array_name, NamedArray};

/// Where the converted file for `npy_file` goes
pub fn mat_output_path(npy_file: &Path, output_dir: Option<&Path>) -> PathBuf {
    let file_name = format!("{}.mat", array_name(npy_file));
    match output_dir {
        Some(dir) => dir.join(file_name),
        None => PathBuf::from(file_name),
    }
}

/// Convert one `.npy` file to a single-variable `.mat` file
///
/// The variable is named after the input's base name. `output_dir` is created
/// if missing. A failed write leaves whatever was written in place.
pub fn convert_npy_to_mat(npy_file: &Path, output_dir: Option<&Path>) -> Result<PathBuf, TrajError> {
    let array = NamedArray::load(npy_file)?;
    debug!(
        "Loaded '{}' {:?} {:?}{} from {}",
        array.name,
        array.shape(),
        array.dtype,
        if array.fortran_order { " (fortran order)" } else { "" },
        npy_file.display()
    );

    let mat_path = mat_output_path(npy_file, output_dir);
    if let Some(dir) = output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create output directory {}", dir.display()))
            .map_err(|source| TrajError::Save {
                path: mat_path.clone(),
                source,
            })?;
    }

    write_mat(&mat_path, &array)?;
    Ok(mat_path)
}

/// Run a conversion and print its one-line outcome to `out`
///
/// Conversion failures are reported, not returned: only a failure to write
/// the report itself is an error.
pub fn run_conversion<W: Write>(
    npy_file: &Path,
    output_dir: Option<&Path>,
    out: &mut W,
) -> std::io::Result<Option<PathBuf>> {
    match convert_npy_to_mat(npy_file, output_dir) {
        Ok(mat_path) => {
            writeln!(
                out,
                "Converted {} to {}",
                npy_file.display(),
                mat_path.display()
            )?;
            Ok(Some(mat_path))
        }
        Err(err @ TrajError::Load { .. }) => {
            warn!("Conversion of {} failed: {err}", npy_file.display());
            writeln!(out, "Error loading {}: {err}", npy_file.display())?;
            Ok(None)
        }
        Err(err) => {
            let target = err
                .path()
                .map_or_else(|| mat_output_path(npy_file, output_dir), Path::to_path_buf);
            warn!("Conversion of {} failed: {err}", npy_file.display());
            writeln!(out, "Error saving {}: {err}", target.display())?;
            Ok(None)
        }
    }
}
