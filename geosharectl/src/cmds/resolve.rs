//! This is the module handling the `resolve` sub-command.
//!

use std::sync::Arc;

use eyre::Result;
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing::trace;

use geoshare_client::{ClientConfig, Coordinate, GeoLookupCache, NominatimGeocoder, ResolvedLocation};

use crate::ResolveOpts;

/// One-shot reverse lookup through the cache.
///
#[tracing::instrument(skip(cfg))]
pub async fn resolve_position(cfg: &ClientConfig, opts: &ResolveOpts) -> Result<String> {
    trace!("resolve_position({}, {})", opts.lat, opts.lon);

    let coord = Coordinate::new(opts.lat, opts.lon, "geosharectl")?;
    let geocoder = Arc::new(NominatimGeocoder::new(&cfg.geocoder)?);
    let cache = GeoLookupCache::new(geocoder, &cfg.cache);

    let loc = cache.resolve(&coord).await?;
    Ok(table(&loc))
}

fn table(loc: &ResolvedLocation) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Field", "Value"]);
    builder.push_record(["Name".to_string(), loc.display_name.clone()]);
    builder.push_record([
        "Category".to_string(),
        loc.category.clone().unwrap_or_default(),
    ]);
    builder.push_record([
        "Type".to_string(),
        loc.address_type.clone().unwrap_or_default(),
    ]);
    builder.push_record(["Position".to_string(), loc.coordinate.to_string()]);
    builder.push_record(["Resolved".to_string(), loc.resolved_at.to_rfc3339()]);

    builder.build().with(Style::rounded()).to_string()
}
