use anyhow::Result;
use camino::Utf8Path;

use crate::repo::Repository;

pub fn run(repository: &Utf8Path) -> Result<()> {
    Repository::init(repository)
}
