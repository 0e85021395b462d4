use std::rc::Rc;

use anyhow::Result;
use camino::Utf8Path;
use clap::Parser;

use crate::object;
use crate::repo::Repository;
use crate::vfs;

/// List a path in the repository's virtual file system
#[derive(Debug, Parser)]
pub struct Args {
    /// What to list, e.g. /somebranch/latest/some/dir
    #[arg(default_value = "/")]
    path: String,
}

pub fn run(repository: &Utf8Path, args: Args) -> Result<()> {
    let repo = Rc::new(Repository::open(repository)?);
    let root = vfs::root(repo);

    let node = root.resolve(&args.path)?;
    if object::is_dir(node.mode()) {
        for sub in node.subs()? {
            print_node(&sub)?;
        }
    } else {
        print_node(&node)?;
    }
    Ok(())
}

fn print_node(node: &vfs::Node) -> Result<()> {
    if node.is_symlink() {
        println!("{} -> {}", node.name(), node.readlink()?);
    } else if object::is_dir(node.mode()) {
        println!("{}{}", node.name(), std::path::MAIN_SEPARATOR);
    } else {
        println!("{}", node.name());
    }
    Ok(())
}
