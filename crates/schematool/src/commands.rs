use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use models::DatasetSchema;
use sources::{get_schema_loader, CachedSchemaLoader};

use crate::{Cli, Command};

pub fn run(cli: Cli) -> anyhow::Result<()> {
    let loader = CachedSchemaLoader::new(get_schema_loader(&cli.schema_url)?);

    match cli.command {
        Command::ImportSchemas { ref dataset } => import_schemas(&loader, dataset.as_deref()),
        Command::CreateTables {
            ref datasets,
            versioned,
            dry_run,
        } => {
            let datasets = load_datasets(&loader, datasets)?;
            let mut statements = Vec::new();
            for dataset in &datasets {
                statements.extend(ddl::plan_dataset(dataset, &loader, versioned)?.statements);
            }
            execute_or_print(&cli, statements, dry_run)
        }
        Command::CreateViews {
            ref datasets,
            dry_run,
        } => {
            let datasets = load_datasets(&loader, datasets)?;
            let mut statements = Vec::new();
            for dataset in &datasets {
                for table in dataset.tables() {
                    if !table.is_view() {
                        continue;
                    }
                    match ddl::view_statements(dataset, table, &loader) {
                        Ok(view) => statements.extend(view),
                        Err(err) => {
                            tracing::error!(view = %table.id, error = %err, "skipping invalid view");
                            anyhow::bail!("view '{}' is invalid: {err}", table.id);
                        }
                    }
                }
            }
            execute_or_print(&cli, statements, dry_run)
        }
        Command::ApplyPermissions {
            ref datasets,
            auto,
            ref role,
            ref scope,
            revoke,
            create_roles,
            with_profiles,
            ref pg_schema,
            dry_run,
        } => {
            let datasets = load_datasets(&loader, datasets)?;
            let target = if auto {
                ddl::RoleTarget::Auto
            } else {
                match (role, scope) {
                    (Some(role), Some(scope)) => ddl::RoleTarget::Single {
                        role: role.clone(),
                        scope: scope.clone(),
                    },
                    _ => anyhow::bail!("pass either --auto or both --role and --scope"),
                }
            };

            let mut statements = Vec::new();
            for dataset in &datasets {
                if revoke {
                    let mut roles: Vec<String> = match &target {
                        ddl::RoleTarget::Auto => ddl::collect_scopes(dataset)
                            .iter()
                            .map(|s| ddl::scope_to_role(s))
                            .collect(),
                        ddl::RoleTarget::Single { role, .. } => vec![role.clone()],
                    };
                    roles.push(ddl::write_role(&dataset.id));
                    for role in roles {
                        statements.push(ddl::revoke_statement(pg_schema, dataset, &role));
                    }
                }

                let read_grants = ddl::dataset_read_grants(dataset, &target)?;
                let write_grants = ddl::dataset_write_grants(dataset);
                if create_roles {
                    let mut grantees: Vec<String> = read_grants
                        .iter()
                        .chain(write_grants.iter())
                        .flat_map(|g| g.grantees.clone())
                        .collect();
                    grantees.sort();
                    grantees.dedup();
                    for grantee in grantees {
                        statements.push(ddl::create_role_statement(&grantee));
                    }
                }
                for grant in read_grants.iter().chain(write_grants.iter()) {
                    statements.extend(ddl::grant_statements(pg_schema, grant));
                }
            }

            if with_profiles {
                if let ddl::RoleTarget::Single { role, scope } = &target {
                    let profiles =
                        sources::get_profile_loader(&cli.profiles_url)?.get_all_profiles()?;
                    let dataset_refs: Vec<&DatasetSchema> =
                        datasets.iter().map(|d| d.as_ref()).collect();
                    for grant in
                        ddl::profile_read_grants(&profiles, &dataset_refs, role, scope)
                    {
                        statements.extend(ddl::grant_statements(pg_schema, &grant));
                    }
                }
            }
            execute_or_print(&cli, statements, dry_run)
        }
        Command::ImportNdjson {
            ref dataset,
            ref table,
            ref file,
            batch_size,
        } => {
            let dataset = loader.get_dataset(dataset, true)?;
            runtime()?.block_on(async {
                let pool = pool(&cli).await?;
                let stats = importer::BulkImporter::new(&pool)
                    .with_batch_size(batch_size)
                    .import_ndjson(&dataset, &loader, table, file)
                    .await?;
                println!(
                    "imported {} records ({} duplicates, {} errors)",
                    stats.imported, stats.duplicates, stats.record_errors
                );
                Ok(())
            })
        }
        Command::ImportGeojson {
            ref dataset,
            ref table,
            ref file,
            batch_size,
        } => {
            let dataset = loader.get_dataset(dataset, true)?;
            runtime()?.block_on(async {
                let pool = pool(&cli).await?;
                let stats = importer::BulkImporter::new(&pool)
                    .with_batch_size(batch_size)
                    .import_geojson(&dataset, &loader, table, file)
                    .await?;
                println!(
                    "imported {} features ({} duplicates, {} errors)",
                    stats.imported, stats.duplicates, stats.record_errors
                );
                Ok(())
            })
        }
        Command::ImportEvents {
            ref file,
            ref datasets,
            bulk,
            recovery,
            truncate,
        } => {
            let mut loaded = Vec::with_capacity(datasets.len());
            for dataset_id in datasets {
                loaded.push(loader.get_dataset(dataset_id, true)?);
            }
            let events = events::read_events_file(file)?;
            runtime()?.block_on(async {
                let pool = pool(&cli).await?;
                let mut processor = events::EventsProcessor::new(loaded, pool, truncate).await?;
                if bulk {
                    processor.process_events(&events, recovery).await?;
                } else {
                    for event in events {
                        processor.process_event(event, recovery).await?;
                    }
                }
                Ok(())
            })
        }
        Command::SqlMigrateSchema {
            ref dataset,
            ref table,
            ref from_version,
            ref to_version,
        } => {
            let dataset = loader.get_dataset(dataset, false)?;
            let from = loader.get_table(&dataset, &format!("{table}/v{from_version}"))?;
            let to = loader.get_table(&dataset, &format!("{table}/v{to_version}"))?;
            for statement in crate::migrate::migrate_statements(&dataset, &from, &to, &loader)? {
                println!("{statement};");
            }
            Ok(())
        }
        Command::ExportEvents {
            ref dataset,
            ref table,
            ref output,
        } => {
            let dataset = loader.get_dataset(dataset, true)?;
            runtime()?.block_on(async {
                let pool = pool(&cli).await?;
                let count = match output {
                    Some(path) => {
                        let mut file = std::fs::File::create(path)
                            .with_context(|| format!("creating {}", path.display()))?;
                        events::export_events(&pool, &dataset, &loader, table, &mut file).await?
                    }
                    None => {
                        let mut stdout = std::io::stdout().lock();
                        events::export_events(&pool, &dataset, &loader, table, &mut stdout).await?
                    }
                };
                tracing::info!(count, "exported events");
                Ok(())
            })
        }
    }
}

fn import_schemas(loader: &CachedSchemaLoader, dataset_id: Option<&str>) -> anyhow::Result<()> {
    let datasets: Vec<Arc<DatasetSchema>> = match dataset_id {
        Some(id) => vec![loader.get_dataset(id, true)?],
        None => loader.get_all_datasets()?.into_values().collect(),
    };

    let mut failures = 0;
    for dataset in &datasets {
        match dataset.validate() {
            Ok(()) => println!("{}: {} tables", dataset.id, dataset.tables().len()),
            Err(err) => {
                failures += 1;
                eprintln!("{err}");
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} dataset(s) failed validation");
    }
    Ok(())
}

fn load_datasets(
    loader: &CachedSchemaLoader,
    ids: &[String],
) -> anyhow::Result<Vec<Arc<DatasetSchema>>> {
    if ids.is_empty() {
        Ok(loader.get_all_datasets()?.into_values().collect())
    } else {
        ids.iter()
            .map(|id| Ok(loader.get_dataset(id, true)?))
            .collect()
    }
}

fn execute_or_print(cli: &Cli, statements: Vec<String>, dry_run: bool) -> anyhow::Result<()> {
    if dry_run {
        for statement in &statements {
            println!("{statement};");
        }
        return Ok(());
    }
    runtime()?.block_on(async {
        let pool = pool(cli).await?;
        ddl::apply_statements(&pool, &statements).await?;
        Ok(())
    })
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

async fn pool(cli: &Cli) -> anyhow::Result<PgPool> {
    let url = cli
        .database_url
        .as_deref()
        .context("no database configured; pass --db-url or set DATABASE_URL")?;
    Ok(PgPool::connect(url).await?)
}
