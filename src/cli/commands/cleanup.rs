//! Cleanup command - run the images and stages phases for a project

use crate::audit::AuditLog;
use crate::cleanup::{CleanupReport, CleanupRunOptions, Coordinator, RunFailure};
use crate::cli::args::{CleanupArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::{KeelError, KeelResult};
use crate::git::GitResolver;
use crate::kube::KubectlLister;
use crate::lock::FileLockManager;
use crate::policy::{default_policies, CleanupPolicy};
use crate::registry::{create_images_repo, create_stages_storage, RegistryOptions};
use crate::ui::{self, RunEnd, RunSpinner, UiContext};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Execute the cleanup command
pub async fn execute(args: CleanupArgs, config: &Config, project_dir: &Path) -> KeelResult<()> {
    let cli_policies = args
        .images_cleanup_policies
        .as_deref()
        .map(CleanupPolicy::parse_list)
        .transpose()?;

    let (project_config_path, project) = ConfigManager::load_project(project_dir).await?;
    let project_root = project_config_path
        .parent()
        .unwrap_or(project_dir)
        .to_path_buf();

    let policies = match cli_policies {
        Some(policies) => policies,
        None => match project.policies()? {
            Some(policies) => policies,
            None => default_policies()?,
        },
    };
    for policy in &policies {
        debug!("Policy: {}", policy);
    }

    ConfigManager::ensure_state_dirs().await?;

    let mut registry_options = RegistryOptions::from_config(&config.registry);
    registry_options.docker_config = args.docker_config.clone();
    registry_options.insecure = args.insecure_repo;

    let options = CleanupRunOptions {
        project_name: project.project.name.clone(),
        image_names: project.project.images.clone(),
        policies,
        dry_run: args.dry_run,
        without_kube: args.without_kube,
        workers: args.workers.unwrap_or(config.cleanup.workers),
    };

    let mut coordinator = Coordinator::new(
        Arc::from(create_images_repo(&args.images_repo, &registry_options)),
        Arc::from(create_stages_storage(
            &args.stages_storage,
            &options.project_name,
            &registry_options,
        )),
        Arc::new(GitResolver::new(project_root)),
        Arc::new(KubectlLister::new(
            &config.kube.kubectl_bin,
            args.kube_config.clone().or_else(|| config.kube.kubeconfig.clone()),
            args.kube_context.clone().or_else(|| config.kube.context.clone()),
        )),
        Arc::new(FileLockManager::new(
            ConfigManager::locks_dir(),
            config.cleanup.lock_wait,
        )),
    )
    .with_audit(AuditLog::new(config));

    let json = args.format == OutputFormat::Json;
    let ctx = if json {
        UiContext::non_interactive()
    } else {
        UiContext::detect()
    };

    let spinner = (!json).then(|| {
        let mode = if options.dry_run { " (dry run)" } else { "" };
        ui::intro(&ctx, &format!("keel cleanup: {}{}", options.project_name, mode));
        RunSpinner::start(&ctx, &format!("Cleaning up {}...", options.project_name))
    });

    let outcome = tokio::select! {
        outcome = coordinator.run(&options) => outcome,
        _ = tokio::signal::ctrl_c() => {
            if let Some(s) = spinner {
                s.finish(RunEnd::Aborted, "Interrupted, lock released");
            }
            return Err(KeelError::Interrupted);
        }
    };

    match outcome {
        Ok(report) => {
            if let Some(s) = spinner {
                match report.failure_count() {
                    0 => s.finish(RunEnd::Clean, "Cleanup finished"),
                    n => s.finish(
                        RunEnd::WithFailures,
                        &format!("Cleanup finished with {} failure(s)", n),
                    ),
                }
            }
            print_report(&ctx, &report, args.format)
        }
        Err(RunFailure { error, report, during }) => {
            if let Some(s) = spinner {
                s.finish(RunEnd::Aborted, &format!("Cleanup failed during {}", during));
            }
            print_report(&ctx, &report, args.format)?;
            Err(error)
        }
    }
}

fn print_report(ctx: &UiContext, report: &CleanupReport, format: OutputFormat) -> KeelResult<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Table => print_table(ctx, report),
    }
    Ok(())
}

fn print_table(ctx: &UiContext, report: &CleanupReport) {
    for warning in &report.warnings {
        ui::warning(ctx, warning);
    }

    let delete_label = if report.dry_run { "would delete" } else { "deleted" };

    ui::section(ctx, "Images");
    let images = &report.images;
    if images.kept.is_empty() && images.deleted.is_empty() && images.failures.is_empty() {
        ui::detail(ctx, "No tags found");
    } else {
        println!(
            "{:<60} {:<14} {:<20}",
            style("TAG").bold(),
            style("ACTION").bold(),
            style("REASON").bold()
        );
        println!("{}", "-".repeat(94));

        for record in &images.kept {
            println!(
                "{:<60} {:<14} {:<20}",
                record.reference,
                style("keep").green(),
                record.reason
            );
        }
        for record in &images.deleted {
            println!(
                "{:<60} {:<14} {:<20}",
                record.reference,
                style(delete_label).red(),
                record.reason
            );
        }
        for failure in &images.failures {
            ui::failure(ctx, &failure.item, &failure.reason);
        }
    }

    ui::section(ctx, "Stages");
    let stages = &report.stages;
    ui::key_value(ctx, "Retained", &stages.retained.to_string());
    ui::key_value(
        ctx,
        if report.dry_run { "Would delete" } else { "Deleted" },
        &stages.deleted.len().to_string(),
    );
    for stage in &stages.deleted {
        ui::detail(ctx, &format!("{} {}", delete_label, stage.digest));
    }
    for failure in &stages.failures {
        ui::failure(ctx, &failure.item, &failure.reason);
    }
    if !stages.skipped.is_empty() {
        ui::key_value(ctx, "Skipped", &stages.skipped.len().to_string());
    }

    ui::outro(
        ctx,
        &format!(
            "{} tag(s) and {} stage(s) {}",
            images.deleted.len(),
            stages.deleted.len(),
            delete_label
        ),
        report.failure_count(),
    );
}
