use visage_core::{DetectedPerson, DetectionResult, Gender};

use crate::model::RawFace;

/// Map one model face into the public person shape.
///
/// The label is the more likely of the two categories. A model that reports
/// a label with a score under 0.5 is really saying the other one, so the
/// label flips and the confidence becomes the complement.
pub fn map_face(face: &RawFace) -> DetectedPerson {
    let reported = match face.gender.as_deref().map(str::parse::<Gender>) {
        Some(Ok(gender)) => gender,
        _ => Gender::Female,
    };
    let age = face.age.filter(|a| a.is_finite() && *a > 0.0).unwrap_or(0.0);

    match face.gender_score.filter(|s| s.is_finite()) {
        Some(score) => {
            let score = score.clamp(0.0, 1.0);
            if score < 0.5 {
                DetectedPerson {
                    age,
                    gender: reported.opposite(),
                    confidence: 1.0 - score,
                }
            } else {
                DetectedPerson {
                    age,
                    gender: reported,
                    confidence: score,
                }
            }
        }
        None => DetectedPerson {
            age,
            gender: reported,
            confidence: 0.0,
        },
    }
}

/// Map every face, keeping model order.
pub fn map_faces(faces: &[RawFace]) -> DetectionResult {
    DetectionResult::from_persons(faces.iter().map(map_face).collect())
}
