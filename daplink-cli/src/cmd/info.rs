use daplink_target::Registry;

use super::BoardOptions;

#[derive(clap::Parser)]
pub struct Cmd {
    #[clap(flatten)]
    board: BoardOptions,
    /// Print the full target description as YAML.
    #[clap(long)]
    yaml: bool,
}

impl Cmd {
    pub fn run(self, registry: &Registry, default_board: Option<&str>) -> anyhow::Result<()> {
        let target = self.board.resolve(registry, default_board)?;

        if self.yaml {
            print!("{}", target.to_yaml_string()?);
            return Ok(());
        }

        println!("{} ({})", target.name, target.board_id);
        if let Some(url) = &target.url {
            println!("  {url}");
        }
        println!("Flash regions:");
        for region in &target.flash_regions {
            let mut flags = vec![];
            if region.default {
                flags.push("default");
            }
            if region.is_alias {
                flags.push("alias");
            }
            println!(
                "  {:#010x}..{:#010x} {:<16} {} sectors, algorithm {} {}",
                region.start,
                region.end,
                region.name.as_deref().unwrap_or("-"),
                region.sectors().count(),
                region.algorithm,
                flags.join(", ")
            );
        }
        println!("RAM regions:");
        for region in &target.ram_regions {
            println!(
                "  {:#010x}..{:#010x} {}",
                region.start,
                region.end,
                region.name.as_deref().unwrap_or("-")
            );
        }
        println!("Flash algorithms:");
        for algorithm in &target.algorithms {
            println!(
                "  {}: {} byte blob at {:#010x}, {} byte pages, chip erase {}",
                algorithm.name,
                algorithm.algo_size(),
                algorithm.algo_start,
                algorithm.program_buffer_size,
                if algorithm.supports_erase_chip() {
                    "supported"
                } else {
                    "not supported"
                }
            );
        }

        Ok(())
    }
}
