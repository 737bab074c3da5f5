use crate::codec;
use crate::types::{EnrolledIdentity, FaceDescriptor, MatchResult};

/// Maximum Euclidean distance accepted as a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Strategy for comparing a sample descriptor against enrolled identities.
pub trait Matcher {
    fn compare(
        &self,
        sample: &FaceDescriptor,
        gallery: &[EnrolledIdentity],
        threshold: f32,
    ) -> MatchResult;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// Candidates are skipped when their stored descriptor cannot be decoded,
/// when its length differs from the sample's, or when the distance is not
/// finite. The first candidate reaching the minimum distance wins; later
/// candidates at the same distance do not replace it.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        sample: &FaceDescriptor,
        gallery: &[EnrolledIdentity],
        threshold: f32,
    ) -> MatchResult {
        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;
        let mut skipped = 0usize;

        for (i, identity) in gallery.iter().enumerate() {
            let candidate = match codec::decode(&identity.descriptor) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(
                        identity = %identity.identity_id,
                        error = %e,
                        "skipping candidate with undecodable descriptor"
                    );
                    skipped += 1;
                    continue;
                }
            };

            let distance = match sample.euclidean_distance(&candidate) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(
                        identity = %identity.identity_id,
                        error = %e,
                        "skipping candidate with incomparable descriptor"
                    );
                    skipped += 1;
                    continue;
                }
            };

            if !distance.is_finite() {
                tracing::warn!(
                    identity = %identity.identity_id,
                    "skipping candidate whose distance overflows"
                );
                skipped += 1;
                continue;
            }

            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_distance < threshold => {
                let winner = &gallery[idx];
                tracing::debug!(
                    identity = %winner.identity_id,
                    distance = best_distance,
                    skipped,
                    "sample recognized"
                );
                MatchResult {
                    recognized: true,
                    distance: Some(best_distance),
                    confidence: Some((1.0 - best_distance).clamp(0.0, 1.0)),
                    identity_id: Some(winner.identity_id.clone()),
                    display_name: Some(winner.display_name.clone()),
                    skipped,
                }
            }
            Some(_) => {
                tracing::debug!(distance = best_distance, skipped, "sample not recognized");
                MatchResult::unrecognized(Some(best_distance), skipped)
            }
            None => MatchResult::unrecognized(None, skipped),
        }
    }
}
