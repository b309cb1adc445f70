use env_logger::Env;
use std::io::Write;

const DEFAULT_REGION: &str = "local";

/*
 * Outside of prod the environment name is prepended to the region so
 * lines from staging clusters can't be mistaken for production ones.
 */
pub fn region_tag(deploy_env: Option<&str>, region: Option<&str>) -> String {
    let region = region.filter(|r| !r.is_empty()).unwrap_or(DEFAULT_REGION);

    match deploy_env {
	Some(env) if !env.is_empty() && env != "prod" => format!("{}-{}", env, region),
	_ => region.to_string(),
    }
}

/*
 * Install env_logger, honouring RUST_LOG (default: info), with every line
 * tagged by region.
 */
pub fn init_logger(deploy_env: Option<&str>, region: Option<&str>) {
    let tag = region_tag(deploy_env, region);

    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
	.format(move |buf, record| {
	    writeln!(
		buf,
		"[{} {:<5} {} {}] {}",
		buf.timestamp(),
		record.level(),
		tag,
		record.target(),
		record.args()
	    )
	})
	.init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prod_region_is_bare() {
	assert_eq!(region_tag(Some("prod"), Some("eastus")), "eastus");
	assert_eq!(region_tag(None, Some("eastus")), "eastus");
    }

    #[test]
    fn non_prod_region_is_prefixed() {
	assert_eq!(region_tag(Some("staging"), Some("eastus")), "staging-eastus");
	assert_eq!(region_tag(Some("dev"), None), "dev-local");
    }
}
