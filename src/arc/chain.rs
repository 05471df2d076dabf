use std::collections::BTreeMap;

use tracing::debug;

use crate::common::dns::DnsResolver;
use crate::common::status::{VerifyResult, VerifyStatus};
use crate::header::parse_header_field;

use super::{
    ArcAuthenticationResults, ArcError, ArcMessageSignature, ArcSeal, ChainValidation,
};

/// One complete ARC set: the AAR/AMS/AS triple of a single instance.
#[derive(Debug, Clone)]
pub struct ArcSet {
    pub aar: ArcAuthenticationResults,
    pub ams: ArcMessageSignature,
    pub seal: ArcSeal,
}

#[derive(Default)]
pub(crate) struct SetBuilder {
    pub aar: Option<ArcAuthenticationResults>,
    pub ams: Option<ArcMessageSignature>,
    pub seal: Option<ArcSeal>,
}

/// Group ARC header lines by instance number. Later lines overwrite earlier
/// ones of the same kind, which lets a blanked seal replace the signed copy
/// during seal verification. Non-ARC lines are ignored.
pub(crate) fn collect_builders(
    headers: &[String],
) -> Result<BTreeMap<u32, SetBuilder>, ArcError> {
    let mut sets: BTreeMap<u32, SetBuilder> = BTreeMap::new();

    for header in headers {
        let (name, _) = parse_header_field(header);
        match name.to_ascii_lowercase().as_str() {
            "arc-authentication-results" => {
                let aar = ArcAuthenticationResults::parse(header)?;
                let instance = aar.instance;
                sets.entry(instance).or_default().aar = Some(aar);
            }
            "arc-message-signature" => {
                let ams = ArcMessageSignature::parse(header)?;
                let instance = ams.instance;
                sets.entry(instance).or_default().ams = Some(ams);
            }
            "arc-seal" => {
                let seal = ArcSeal::parse(header)?;
                let instance = seal.instance;
                sets.entry(instance).or_default().seal = Some(seal);
            }
            _ => {}
        }
    }

    Ok(sets)
}

/// Collect the complete ARC sets of a message, ascending by instance.
///
/// Returns an error when an ARC header fails to parse or when the sets are
/// not a contiguous, complete run 1..=M.
pub fn collect_sets(headers: &[String]) -> Result<Vec<ArcSet>, ArcError> {
    let builders = collect_builders(headers)?;
    let max = builders.keys().next_back().copied().unwrap_or(0);

    let mut sets = Vec::with_capacity(max as usize);
    for i in 1..=max {
        let builder = builders.get(&i).ok_or(ArcError::MissingInstance(i))?;
        match (&builder.aar, &builder.ams, &builder.seal) {
            (Some(aar), Some(ams), Some(seal)) => sets.push(ArcSet {
                aar: aar.clone(),
                ams: ams.clone(),
                seal: seal.clone(),
            }),
            _ => return Err(ArcError::MissingInstance(i)),
        }
    }
    Ok(sets)
}

/// Validate the full ARC chain of a message.
///
/// The sets must form a contiguous run of complete triples; the newest seal
/// must carry `cv=none` exactly when it is the only set and `cv=pass`
/// otherwise; every seal must verify over the sets it covers; and the newest
/// AMS must verify against the message. Any presented `cv=fail`, or any
/// verification failure, makes the chain fail. A message without ARC headers
/// yields status `none`.
pub async fn verify_chain<R: DnsResolver>(
    headers: &[String],
    body_hash: &str,
    resolver: &R,
) -> VerifyResult {
    let sets = match collect_sets(headers) {
        Ok(sets) => sets,
        Err(ArcError::MissingInstance(i)) => {
            return VerifyResult::new(
                VerifyStatus::Fail,
                format!("arc set {i} is incomplete"),
            );
        }
        Err(e) => {
            debug!(error = %e, "arc header parse failed");
            return VerifyResult::new(VerifyStatus::Fail, "failed to parse arc headers");
        }
    };

    if sets.is_empty() {
        return VerifyResult::new(VerifyStatus::None, "no arc headers found");
    }

    // cv discipline: none at the first instance, pass everywhere after.
    for set in &sets {
        let expected = if set.seal.instance == 1 {
            ChainValidation::None
        } else {
            ChainValidation::Pass
        };
        if set.seal.chain_validation == ChainValidation::Fail {
            return VerifyResult::new(VerifyStatus::Fail, "chain validation result is fail");
        }
        if set.seal.chain_validation != expected {
            return VerifyResult::new(
                VerifyStatus::Fail,
                format!(
                    "unexpected cv value {} at instance {}",
                    set.seal.chain_validation, set.seal.instance
                ),
            );
        }
    }

    // Each seal covers the sets up to its own instance.
    for (idx, set) in sets.iter().enumerate() {
        let mut covered = Vec::new();
        for prior in &sets[..=idx] {
            covered.push(prior.aar.raw());
            covered.push(prior.ams.raw());
            covered.push(prior.seal.raw());
        }
        let result = set.seal.verify_with_resolver(&covered, resolver).await;
        match result.status() {
            VerifyStatus::Pass => {}
            VerifyStatus::TempError => return result,
            _ => {
                return VerifyResult::new(
                    VerifyStatus::Fail,
                    format!(
                        "seal for instance {} did not verify: {}",
                        set.seal.instance,
                        result.message()
                    ),
                );
            }
        }
    }

    // The newest AMS must bind the message itself.
    let newest = &sets[sets.len() - 1];
    let result = newest
        .ams
        .verify_with_resolver(headers, body_hash, resolver)
        .await;
    match result.status() {
        VerifyStatus::Pass => {}
        VerifyStatus::TempError => return result,
        _ => {
            return VerifyResult::new(
                VerifyStatus::Fail,
                format!(
                    "message signature for instance {} did not verify: {}",
                    newest.ams.instance,
                    result.message()
                ),
            );
        }
    }

    VerifyResult::new(VerifyStatus::Pass, "good chain")
}
