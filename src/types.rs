/// Logical dataset identifier; also the first remote and local path segment.
/// Example: `mta_subway_hourly_ridership`
pub type DatasetName = String;
/// Fully qualified remote address of one batch file.
/// Example: `https://fastopendata.org/rides/year=2022/month=03/rides_202203_1.parquet`
pub type RemoteUrl = String;
/// File extension of batch artifacts, without the leading dot.
/// Examples: `parquet`, `csv`
pub type ArtifactExtension = String;
