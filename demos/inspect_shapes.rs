//! Print the shapes of saved arrays
//!
//! Usage:
//!   cargo run --example inspect_shapes
//!   cargo run --example inspect_shapes -- final_embeddings_Llama-3.2-1B_chunk50.npy out/example.mat

use anyhow::Result;
use std::path::PathBuf;
use traj_rs::{read_variables, NamedArray};

fn format_shape(dims: &[usize]) -> String {
    let parts: Vec<String> = dims.iter().map(ToString::to_string).collect();
    format!("({})", parts.join(", "))
}

fn main() -> Result<()> {
    let mut paths: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        paths = vec![
            PathBuf::from("trajectories.npy"),
            PathBuf::from("singular_vectors.npy"),
        ];
    }

    for path in &paths {
        let is_mat = path.extension().is_some_and(|ext| ext == "mat");
        if is_mat {
            for variable in read_variables(path)? {
                println!(
                    "{} [{}] shape: {}",
                    path.display(),
                    variable.name,
                    format_shape(&variable.dims)
                );
            }
        } else {
            let array = NamedArray::load(path)?;
            println!("{} shape: {}", path.display(), format_shape(array.shape()));
        }
    }

    Ok(())
}
