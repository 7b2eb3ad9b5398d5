use crate::prelude::*;

use serde_json::{json, Value};

use super::args::parse_positions;
use super::{Call, CommandError, HandlerResult, Registry, Reply};
use crate::batch::{BatchRunResult, PendingMutation};
use crate::services::Services;
use crate::shape;
use crate::world::MutationSpec;

/// Ground level assumed for a column with nothing in it.
const DEFAULT_GROUND: i32 = 64;

macro_rules! commands {
    {$registry:ident; $($name:ident($($param:ident),*) $(| $alias:ident)* => $handler:path,)*} => {
        $(
            $registry.register(stringify!($name), &[$(stringify!($param)),*], $handler);
            $($registry.alias(stringify!($alias), stringify!($name));)*
        )*
    };
}

pub(super) fn register_all(registry: &mut Registry) {
    commands! {
        registry;
        ping() => ping,
        status() | connect => status,
        getBlock(x, y, z) => get_block,
        setBlock(x, y, z, block) | placeBlock => set_block,
        removeBlock(x, y, z) => remove_block,
        fillArea(x1, y1, z1, x2, y2, z2, block) | fill => fill_area,
        buildCircle(x, y, z, radius, block) => build_circle,
        buildSphere(x, y, z, radius, block) => build_sphere,
        buildWall(x1, z1, x2, z2, height, block) => build_wall,
        placePattern(block, positions) => place_pattern,
        queueBlock(x, y, z, block) => queue_block,
        flushQueue() => flush_queue,
        clearQueue() => clear_queue,
        circuitStatus() => circuit_status,
        resetCircuits() => reset_circuits,
        rateStatus() => rate_status,
    }
}

fn batch_data(result: &BatchRunResult) -> Value {
    json!({
        "totalRequested": result.total_requested,
        "succeeded": result.succeeded,
        "failed": result.failed,
        "elapsedMs": result.elapsed.as_millis() as u64,
        "successRate": result.success_rate(),
        "blocksPerSecond": result.mutations_per_second(),
        "fullSuccess": result.is_full_success(),
    })
}

fn too_many(count: u64, limit: u64) -> Result<(), CommandError> {
    if count > limit {
        Err(CommandError::Invalid(format!("{count} blocks requested, the limit is {limit}")))
    } else {
        Ok(())
    }
}

/// Single-block write, breaker-protected and bounded by the command timeout.
async fn mutate(
    services: &Services,
    pos: BlockPos,
    payload: MutationSpec,
) -> Result<(), CommandError> {
    let limit = services.resilience.config().command_timeout();
    services
        .resilience
        .execute("world.setBlock", || {
            let world = Arc::clone(&services.world);
            services.resilience.execute_with_timeout(
                "world.setBlock",
                async move { world.apply_mutation(pos, &payload) },
                limit,
            )
        })
        .await?;
    Ok(())
}

async fn place_all(
    services: &Services,
    positions: Vec<BlockPos>,
    payload: MutationSpec,
) -> Result<BatchRunResult, CommandError> {
    let limit = services.batch.config().run_timeout();
    Ok(services.batch.place_pattern(positions, payload).wait_for(limit).await?)
}

async fn bulk(
    services: &Services,
    positions: Vec<BlockPos>,
    block: Block,
    what: &str,
) -> HandlerResult {
    let result = place_all(services, positions, MutationSpec::Set(block)).await?;
    Ok(Reply::new(format!(
        "Built {what}: {} of {} blocks placed",
        result.succeeded, result.total_requested
    ))
    .with_data(batch_data(&result)))
}

async fn ping(_: Arc<Services>, _: Call) -> HandlerResult {
    Ok(Reply::new("pong"))
}

async fn status(services: Arc<Services>, _: Call) -> HandlerResult {
    Ok(Reply::new("blockgate is running").with_data(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "queueSize": services.batch.queue_size(),
        "openCircuits": services.resilience.open_count(),
        "trackedClients": services.admission.tracked(),
    })))
}

async fn get_block(services: Arc<Services>, call: Call) -> HandlerResult {
    let pos = call.args.pos("x", "y", "z")?;
    let config = services.resilience.config();
    let block = services
        .resilience
        .execute_with_retry(
            "world.getBlock",
            || {
                let world = Arc::clone(&services.world);
                async move { world.block_at(pos) }
            },
            config.max_retries,
            config.retry_delay(),
        )
        .await?;
    Ok(Reply::new(format!("{block} at {pos}")).with_data(json!({
        "x": pos.x,
        "y": pos.y,
        "z": pos.z,
        "block": block.to_string(),
    })))
}

async fn set_block(services: Arc<Services>, call: Call) -> HandlerResult {
    let pos = call.args.pos("x", "y", "z")?;
    let block = call.args.block("block")?;
    mutate(&services, pos, MutationSpec::Set(block)).await?;
    Ok(Reply::new(format!("Placed {block} at {pos}")))
}

async fn remove_block(services: Arc<Services>, call: Call) -> HandlerResult {
    let pos = call.args.pos("x", "y", "z")?;
    mutate(&services, pos, MutationSpec::Clear).await?;
    Ok(Reply::new(format!("Removed block at {pos}")))
}

async fn fill_area(services: Arc<Services>, call: Call) -> HandlerResult {
    let from = call.args.pos("x1", "y1", "z1")?;
    let to = call.args.pos("x2", "y2", "z2")?;
    let block = call.args.block("block")?;
    too_many(shape::cuboid_volume(from, to), services.config.limits.max_fill_volume)?;
    bulk(&services, shape::cuboid(from, to), block, "area").await
}

async fn build_circle(services: Arc<Services>, call: Call) -> HandlerResult {
    let center = call.args.pos("x", "y", "z")?;
    let radius = call.args.int_in("radius", 0..=services.config.limits.max_radius)?;
    let block = call.args.block("block")?;
    bulk(&services, shape::circle(center, radius), block, "circle").await
}

async fn build_sphere(services: Arc<Services>, call: Call) -> HandlerResult {
    let center = call.args.pos("x", "y", "z")?;
    let radius = call.args.int_in("radius", 0..=services.config.limits.max_radius)?;
    let block = call.args.block("block")?;
    bulk(&services, shape::sphere(center, radius), block, "sphere").await
}

/// One above the highest non-air block in the column at `(x, z)`.
fn ground_level(services: &Services, x: i32, z: i32) -> Result<i32, CommandError> {
    for y in (MIN_Y..=MAX_Y).rev() {
        if !services.world.block_at(V3(x, y, z))?.is_air() {
            return Ok(y + 1);
        }
    }
    Ok(DEFAULT_GROUND)
}

async fn build_wall(services: Arc<Services>, call: Call) -> HandlerResult {
    let from = call.args.column("x1", "z1")?;
    let to = call.args.column("x2", "z2")?;
    let height = call.args.int_in("height", 1..=services.config.limits.max_wall_height)?;
    let block = call.args.block("block")?;
    let columns = (to.x - from.x).unsigned_abs().max((to.z - from.z).unsigned_abs()) as u64 + 1;
    too_many(columns * height as u64, services.config.limits.max_fill_volume)?;

    let scan = Arc::clone(&services);
    let base = tokio::task::spawn_blocking(move || ground_level(&scan, from.x, from.z))
        .await
        .map_err(|e| CommandError::Internal(e.to_string()))??;
    bulk(&services, shape::wall(from, to, base, height), block, "wall").await
}

async fn place_pattern(services: Arc<Services>, call: Call) -> HandlerResult {
    let block = call.args.block("block")?;
    let positions = parse_positions("positions", call.args.required("positions")?)?;
    too_many(positions.len() as u64, services.config.limits.max_fill_volume)?;
    bulk(&services, positions, block, "pattern").await
}

async fn queue_block(services: Arc<Services>, call: Call) -> HandlerResult {
    let pos = call.args.pos("x", "y", "z")?;
    let block = call.args.block("block")?;
    let queued = services.batch.enqueue(PendingMutation::new(pos, MutationSpec::Set(block)));
    Ok(Reply::new(format!("Queued {block} at {pos}")).with_data(json!({ "queueSize": queued })))
}

async fn flush_queue(services: Arc<Services>, _: Call) -> HandlerResult {
    let limit = services.batch.config().run_timeout();
    let result = services.batch.run_batch().wait_for(limit).await?;
    Ok(Reply::new(format!(
        "Flushed queue: {} of {} mutations applied",
        result.succeeded, result.total_requested
    ))
    .with_data(batch_data(&result)))
}

async fn clear_queue(services: Arc<Services>, _: Call) -> HandlerResult {
    let cleared = services.batch.clear();
    Ok(Reply::new(format!("Cleared {cleared} queued mutations"))
        .with_data(json!({ "cleared": cleared })))
}

async fn circuit_status(services: Arc<Services>, _: Call) -> HandlerResult {
    let statuses = services.resilience.statuses();
    let data = serde_json::to_value(&statuses).map_err(|e| CommandError::Internal(e.to_string()))?;
    Ok(Reply::new(format!("{} circuit breakers", statuses.len())).with_data(data))
}

async fn reset_circuits(services: Arc<Services>, _: Call) -> HandlerResult {
    services.resilience.reset_all();
    Ok(Reply::new("All circuit breakers reset"))
}

async fn rate_status(services: Arc<Services>, call: Call) -> HandlerResult {
    let count = services.admission.current_count(&call.connection_id);
    let admission = &services.config.admission;
    Ok(Reply::new(format!("{count} of {} requests used", admission.limit)).with_data(json!({
        "count": count,
        "limit": admission.limit,
        "windowMs": admission.window_ms,
    })))
}
