//! Implementation of `zephyr init`: scaffold a pipeline configuration.

use anyhow::bail;
use std::path::Path;

const TEMPLATE: &str = r#"name: ci

triggers:
  - type: push
    branches: [main]
  - type: manual

jobs:
  build:
    runner: alpine
    steps:
      - name: hello
        run: echo "hello from zephyr"
"#;

pub fn init(path: &Path) -> anyhow::Result<i32> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    std::fs::write(path, TEMPLATE)?;
    println!("wrote {}", path.display());
    Ok(0)
}
