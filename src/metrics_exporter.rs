use crate::query::{InventoryRow, QueryEngine};
use crate::store::Result;
use metrics::{describe_gauge, gauge, with_local_recorder};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::BTreeMap;

static IMAGE_INFO: &str = "kubetag_image_info";
static IMAGE_TAG_INFO: &str = "kubetag_image_tag_info";
static IMAGE_VERSION_COUNT: &str = "kubetag_image_version_count";

/// Renders the current inventory as Prometheus gauges in the text exposition format.
///
/// Every scrape records into a fresh recorder, so series of workloads that have gone
/// away since the previous scrape are not reported again.
pub fn render(query: &QueryEngine) -> Result<String> {
    let rows = query.list_current_inventory(None)?;
    Ok(render_rows(&rows))
}

fn render_rows(rows: &[InventoryRow]) -> String {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    with_local_recorder(&recorder, || record(rows));
    handle.render()
}

fn record(rows: &[InventoryRow]) {
    describe_gauge!(
        IMAGE_INFO,
        "Information about container images running in the cluster"
    );
    describe_gauge!(
        IMAGE_TAG_INFO,
        "Detailed information about image tags with timestamps"
    );
    describe_gauge!(IMAGE_VERSION_COUNT, "Count of different versions per image");

    let mut versions: BTreeMap<(&str, &str), u32> = BTreeMap::new();
    for row in rows {
        for container in &row.containers {
            gauge!(
                IMAGE_INFO,
                "image_name" => row.name.clone(),
                "tag" => row.tag.clone(),
                "repository" => row.repository.clone(),
                "resource_type" => row.resource_type.as_str(),
                "resource_name" => row.resource_name.clone(),
                "namespace" => row.namespace.clone(),
                "container" => container.clone()
            )
            .set(1.0);
        }

        gauge!(
            IMAGE_TAG_INFO,
            "image_name" => row.name.clone(),
            "tag" => row.tag.clone(),
            "resource_type" => row.resource_type.as_str(),
            "resource_name" => row.resource_name.clone(),
            "namespace" => row.namespace.clone()
        )
        .set(1.0);

        *versions
            .entry((row.namespace.as_str(), row.name.as_str()))
            .or_default() += 1;
    }

    for ((namespace, image_name), count) in versions {
        gauge!(
            IMAGE_VERSION_COUNT,
            "image_name" => image_name.to_string(),
            "namespace" => namespace.to_string()
        )
        .set(f64::from(count));
    }
}
