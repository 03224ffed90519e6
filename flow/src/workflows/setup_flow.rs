use model::{CreateRawTableInput, EnsurePullabilityInput};
use pt::flow::FlowConnectionConfigs;

use crate::runtime::WorkflowContext;

/// Prepares both peers for the flow: metadata tables, pullability on the
/// source, the raw landing table, and the normalized tables with the
/// probed schemas. Returns the config with the schema and relation-id
/// mappings populated.
pub fn setup_flow_workflow<'a>(
    ctx: &'a WorkflowContext,
    mut cfg: FlowConnectionConfigs,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<FlowConnectionConfigs>> + Send + 'a>>
{
    Box::pin(async move {
    // both connections must be usable before anything is created
    for peer in [&cfg.source, &cfg.destination] {
        let check = ctx
            .execute_activity("check_connection", || {
                ctx.activities.check_connection(ctx.cancel.clone(), peer)
            })
            .await?;
        if check.needs_setup_metadata_tables {
            ctx.execute_activity("setup_metadata_tables", || {
                ctx.activities.setup_metadata_tables(ctx.cancel.clone(), peer)
            })
            .await?;
        }
    }

    // validates slot + publication creation up front; a no-op for
    // non-replicating sources
    ctx.execute_activity("check_replication", || {
        ctx.activities.check_replication(ctx.cancel.clone(), &cfg)
    })
    .await?;

    let source_tables: Vec<String> = cfg
        .table_mappings
        .iter()
        .map(|m| m.source_table_identifier.clone())
        .collect();

    let ensure_pullability_input = EnsurePullabilityInput {
        flow_job_name: cfg.flow_job_name.clone(),
        source_table_identifiers: source_tables.clone(),
    };
    let pullability = ctx
        .execute_activity("ensure_pullability", || {
            ctx.activities.ensure_pullability(
                ctx.cancel.clone(),
                &cfg.source,
                &ensure_pullability_input,
            )
        })
        .await?;
    cfg.src_table_id_name_mapping = pullability.table_identifier_mapping;

    let create_raw_table_input = CreateRawTableInput {
        flow_job_name: cfg.flow_job_name.clone(),
        table_name_mapping: cfg.table_name_mapping(),
    };
    ctx.execute_activity("create_raw_table", || {
        ctx.activities.create_raw_table(
            ctx.cancel.clone(),
            &cfg.destination,
            &create_raw_table_input,
        )
    })
    .await?;

    let schemas = ctx
        .execute_activity("get_table_schema", || {
            ctx.activities
                .get_table_schema(ctx.cancel.clone(), &cfg.source, &source_tables)
        })
        .await?;

    for (mapping, schema) in cfg.table_mappings.iter().zip(schemas) {
        let dst = &mapping.destination_table_identifier;
        let mut dst_schema = schema.clone();
        dst_schema.table_identifier = dst.clone();
        dst_schema
            .columns
            .retain(|c| !mapping.exclude.contains(&c.name));

        let output = ctx
            .execute_activity("setup_normalized_table", || {
                ctx.activities.setup_normalized_table(
                    ctx.cancel.clone(),
                    &cfg.destination,
                    dst,
                    &dst_schema,
                )
            })
            .await?;
        tracing::info!(
            table = output.table_identifier,
            already_exists = output.already_exists,
            "normalized table ready"
        );
        cfg.table_name_schema_mapping.insert(dst.clone(), dst_schema);
    }

    Ok(cfg)
    })
}
